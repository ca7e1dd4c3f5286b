use elf_rewriter::fixture::{Fixture, FixtureBuilder};
use elf_rewriter::{kpack_offload_binary, ElfImage, Error};
use std::fs;
use std::os::unix::fs::PermissionsExt;

const PAGE: u64 = 0x1000;
const FATBIN_SIZE: usize = 0x180;

fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

/// Parses cleanly with goblin and every PT_LOAD satisfies the loader's
/// offset/vaddr congruence requirement.
fn assert_structurally_valid(data: &[u8]) {
    let elf = goblin::elf::Elf::parse(data).expect("output must stay a parseable ELF");
    for ph in &elf.program_headers {
        if ph.p_type == goblin::elf::program_header::PT_LOAD {
            assert_eq!(
                ph.p_offset % PAGE,
                ph.p_vaddr % PAGE,
                "PT_LOAD at {:#x} violates offset/vaddr congruence",
                ph.p_vaddr
            );
        }
    }
}

fn section<'a>(image: &'a ElfImage, name: &str) -> elf_rewriter::SectionHeader {
    image
        .find_section(name)
        .unwrap()
        .unwrap_or_else(|| panic!("section {name} missing"))
        .1
}

fn fatbin_fixture() -> Fixture {
    FixtureBuilder::new().fatbin(vec![0xAA; FATBIN_SIZE]).build()
}

#[test]
fn remove_reclaims_file_space_and_shifts_dependents() {
    let f = fatbin_fixture();
    let size = FATBIN_SIZE as u64;
    let mut image = ElfImage::from_bytes(f.data.clone()).unwrap();

    let removed = image.remove_section_payload(".hip_fatbin").unwrap();
    assert_eq!(removed.size, size);
    assert_eq!(removed.vaddr, f.fatbin_vaddr);
    assert_eq!(image.len(), f.data.len() - FATBIN_SIZE);

    // The section header survives as SHT_NULL with zero size.
    let fatbin = section(&image, ".hip_fatbin");
    assert_eq!(fatbin.sh_type, 0);
    assert_eq!(fatbin.sh_size, 0);

    // Relocations: entries below the removed range are untouched, entries at
    // or past it shift by the removed size; addends pointing into the range
    // stay put, addends past the end shift.
    let rela = section(&image, ".rela.dyn");
    let base = rela.sh_offset as usize;
    let data = image.as_bytes();
    assert_eq!(read_u64(data, base), f.segment_ptr_vaddr - size);
    assert_eq!(read_u64(data, base + 16), f.fatbin_vaddr);
    assert_eq!(read_u64(data, base + 24), f.got_vaddr + 16 - size);
    assert_eq!(read_u64(data, base + 40), f.dynstr_vaddr - size);

    // GOT: null slot skipped, pointer below the removed range untouched,
    // pointer past the end decremented.
    let got = section(&image, ".got");
    let base = got.sh_offset as usize;
    assert_eq!(read_u64(data, base), 0);
    assert_eq!(read_u64(data, base + 8), f.text_vaddr + 0x10);
    assert_eq!(read_u64(data, base + 16), f.dynstr_vaddr - size);

    // Dynamic entries in the address-bearing set shift.
    let dynamic = section(&image, ".dynamic");
    let base = dynamic.sh_offset as usize;
    assert_eq!(read_u64(data, base + 8), f.dynstr_vaddr - size); // DT_STRTAB
    assert_eq!(read_u64(data, base + 24), f.rela_vaddr - size); // DT_RELA
    assert_eq!(read_u64(data, base + 40), 2 * 24); // DT_RELASZ untouched

    assert_structurally_valid(image.as_bytes());
}

#[test]
fn remove_smaller_than_page_stays_valid() {
    let f = FixtureBuilder::new().fatbin(vec![0x11; 0x20]).build();
    let mut image = ElfImage::from_bytes(f.data).unwrap();
    let removed = image.remove_section_payload(".hip_fatbin").unwrap();
    assert_eq!(removed.size, 0x20);
    assert_structurally_valid(image.as_bytes());
}

#[test]
fn remove_missing_section_is_an_error() {
    let f = FixtureBuilder::new().build();
    let mut image = ElfImage::from_bytes(f.data).unwrap();
    let err = image.remove_section_payload(".hip_fatbin").unwrap_err();
    assert!(matches!(err, Error::SectionMissing { .. }));
}

#[test]
fn map_section_creates_read_only_load() {
    let payload = b"MARKER-PAYLOAD".to_vec();
    let f = FixtureBuilder::new().marker(payload.clone()).build();
    let mut image = ElfImage::from_bytes(f.data).unwrap();

    let vaddr = image.map_section_to_new_load(".rocm_kpack_ref", None).unwrap();
    assert_eq!(vaddr % PAGE, 0);

    let marker = section(&image, ".rocm_kpack_ref");
    assert_eq!(marker.sh_addr, vaddr);
    assert_ne!(marker.sh_flags & 0x2, 0, "section must gain SHF_ALLOC");
    let start = marker.sh_offset as usize;
    assert_eq!(&image.as_bytes()[start..start + payload.len()], &payload[..]);

    let elf = goblin::elf::Elf::parse(image.as_bytes()).unwrap();
    let load = elf
        .program_headers
        .iter()
        .find(|p| p.p_type == goblin::elf::program_header::PT_LOAD && p.p_vaddr == vaddr)
        .expect("new PT_LOAD covering the marker");
    assert_eq!(load.p_flags, goblin::elf::program_header::PF_R);
    assert_eq!(load.p_align, PAGE);
    assert_eq!(load.p_filesz, payload.len() as u64);
    assert_structurally_valid(image.as_bytes());
}

#[test]
fn map_section_honors_requested_vaddr() {
    let f = FixtureBuilder::new().marker(b"abc".to_vec()).build();
    let mut image = ElfImage::from_bytes(f.data).unwrap();
    let vaddr = image
        .map_section_to_new_load(".rocm_kpack_ref", Some(0x40_0000))
        .unwrap();
    assert_eq!(vaddr, 0x40_0000);
    assert_structurally_valid(image.as_bytes());
}

#[test]
fn phdr_table_relocates_with_spare_capacity() {
    let f = FixtureBuilder::new().marker(b"abc".to_vec()).tight_phdrs().build();
    let mut image = ElfImage::from_bytes(f.data).unwrap();
    let old_phoff = image.phoff().unwrap();
    let old_phnum = image.phnum().unwrap();

    image.map_section_to_new_load(".rocm_kpack_ref", None).unwrap();

    let new_phoff = image.phoff().unwrap();
    assert_ne!(new_phoff, old_phoff, "table must move when there is no room");
    // One segment for the marker, one covering the relocated table itself.
    assert_eq!(image.phnum().unwrap(), old_phnum + 2);

    // PT_PHDR tracks the relocated table and records the over-allocation.
    let phdrs = image.program_headers().unwrap();
    let pt_phdr = phdrs.iter().find(|p| p.p_type == 6).unwrap();
    assert_eq!(pt_phdr.p_offset, new_phoff);
    assert_eq!(pt_phdr.p_filesz, 16 * 56);
    assert_structurally_valid(image.as_bytes());

    // A second growth fits into the spare slots without moving the table.
    image.map_section_to_new_load(".shstrtab", None).unwrap();
    assert_eq!(image.phoff().unwrap(), new_phoff);
    assert_eq!(image.phnum().unwrap(), old_phnum + 3);
    assert_structurally_valid(image.as_bytes());
}

#[test]
fn set_pointer_updates_value_and_relocation() {
    let f = fatbin_fixture();
    let mut image = ElfImage::from_bytes(f.data).unwrap();

    let target = 0x4242u64;
    image.set_pointer(f.got_vaddr + 16, target).unwrap();

    let data = image.as_bytes();
    assert_eq!(read_u64(data, (f.got_vaddr + 16) as usize), target);
    // Second RELA entry covers this slot; its addend must now be the target.
    assert_eq!(read_u64(data, (f.rela_vaddr + 24 + 16) as usize), target);
}

#[test]
fn set_pointer_without_relocation_fails_for_pie() {
    let f = fatbin_fixture();
    let mut image = ElfImage::from_bytes(f.data).unwrap();
    let err = image.set_pointer(f.got_vaddr, 0x1234).unwrap_err();
    assert!(matches!(err, Error::RelocationMissing { .. }));
}

#[test]
fn set_pointer_without_relocation_is_tolerated_for_exec() {
    let f = FixtureBuilder::new()
        .fatbin(vec![0xAA; 0x40])
        .fixed_position()
        .build();
    let mut image = ElfImage::from_bytes(f.data).unwrap();
    image.set_pointer(f.got_vaddr, 0x1234).unwrap();
    assert_eq!(
        read_u64(image.as_bytes(), f.got_vaddr as usize),
        0x1234
    );
}

#[test]
fn fatbin_magic_flip_and_repeat() {
    let f = fatbin_fixture();
    let mut image = ElfImage::from_bytes(f.data).unwrap();

    image.rewrite_fatbin_magic().unwrap();
    let base = f.segment_vaddr as usize;
    assert_eq!(read_u32(image.as_bytes(), base), 0x4B50_4948);
    assert_eq!(read_u64(image.as_bytes(), base + 8), 0);

    let err = image.rewrite_fatbin_magic().unwrap_err();
    assert!(matches!(err, Error::AlreadyNeutralized));
}

#[test]
fn fatbin_magic_rejects_garbage() {
    let f = fatbin_fixture();
    let mut data = f.data;
    data[f.segment_vaddr as usize..f.segment_vaddr as usize + 4]
        .copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    let mut image = ElfImage::from_bytes(data).unwrap();
    let err = image.rewrite_fatbin_magic().unwrap_err();
    assert!(matches!(err, Error::UnexpectedMagic { magic: 0xDEAD_BEEF }));
}

#[test]
fn kpack_offload_binary_end_to_end() {
    let marker_payload = b"\x82\xb1kpack_search_pathstest".to_vec();
    let f = FixtureBuilder::new()
        .fatbin(vec![0xCC; FATBIN_SIZE])
        .marker(marker_payload.clone())
        .build();

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("libtest.so");
    let output = dir.path().join("out").join("libtest.so");
    fs::write(&input, &f.data).unwrap();
    fs::set_permissions(&input, fs::Permissions::from_mode(0o755)).unwrap();
    fs::create_dir_all(output.parent().unwrap()).unwrap();

    let stats = kpack_offload_binary(&input, &output).unwrap();
    assert!(stats.had_fatbin);
    assert_eq!(stats.removed_bytes, FATBIN_SIZE as u64);

    let out_data = fs::read(&output).unwrap();
    assert!(out_data.len() < f.data.len());
    assert_structurally_valid(&out_data);

    let image = ElfImage::from_bytes(out_data).unwrap();
    let fatbin = section(&image, ".hip_fatbin");
    assert_eq!((fatbin.sh_type, fatbin.sh_size), (0, 0));

    let marker = section(&image, ".rocm_kpack_ref");
    assert_eq!(marker.sh_addr, stats.marker_vaddr);
    let start = marker.sh_offset as usize;
    assert_eq!(
        &image.as_bytes()[start..start + marker_payload.len()],
        &marker_payload[..]
    );

    let segment = section(&image, ".hipFatBinSegment");
    assert_eq!(read_u32(image.as_bytes(), segment.sh_offset as usize), 0x4B50_4948);

    let mode = fs::metadata(&output).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
}

#[test]
fn kpack_offload_binary_without_fatbin_still_maps_marker() {
    let f = FixtureBuilder::new().marker(b"m".to_vec()).build();
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("host-only");
    let output = dir.path().join("host-only.out");
    fs::write(&input, &f.data).unwrap();

    let stats = kpack_offload_binary(&input, &output).unwrap();
    assert!(!stats.had_fatbin);
    assert_eq!(stats.removed_bytes, 0);

    let image = ElfImage::from_path(&output).unwrap();
    let marker = section(&image, ".rocm_kpack_ref");
    assert_eq!(marker.sh_addr, stats.marker_vaddr);
    assert_structurally_valid(image.as_bytes());
}

#[test]
fn rejects_non_elf_input() {
    assert!(matches!(
        ElfImage::from_bytes(b"not an elf at all".to_vec()),
        Err(Error::NotElf)
    ));
}
