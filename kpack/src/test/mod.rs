/*!
Integration-style tests that exercise the scanner, the pack visitor and the
recombine flow against synthesized install trees and shard layouts.
*/

mod scan_tree;
