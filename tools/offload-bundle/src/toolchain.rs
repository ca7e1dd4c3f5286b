//! Locations and invocation of the external binary tools.

use log::debug;
use snafu::{ensure, ResultExt, Snafu};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("could not find tool '{name}' on the system path"))]
    ToolNotFound { name: String, source: which::Error },

    #[snafu(display("tool '{name}' at '{}' does not exist", path.display()))]
    ToolMissing { name: String, path: PathBuf },

    #[snafu(display("failed to spawn '{tool}': {source}"))]
    Spawn { tool: String, source: io::Error },

    #[snafu(display("clang-offload-bundler failed: {stderr}"))]
    BundlerFailed { stderr: String },

    #[snafu(display("objcopy failed: {stderr}"))]
    ObjcopyFailed { stderr: String },

    #[snafu(display("failed to read '{}': {source}", path.display()))]
    ReadBinary { path: PathBuf, source: io::Error },

    #[snafu(display("failed to parse ELF '{}': {source}", path.display()))]
    ParseElf {
        path: PathBuf,
        source: goblin::error::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The external bundler is known to corrupt its own decompression when a
/// compressed bundle carries trailing bytes; these substrings identify that
/// failure so callers can retry with the native codec.
pub fn is_decompression_bug(diagnostic: &str) -> bool {
    let lowered = diagnostic.to_lowercase();
    lowered.contains("decompress") || lowered.contains("src size is incorrect")
}

/// Locations of the external tools, resolved once up front.
#[derive(Debug, Clone)]
pub struct Toolchain {
    clang_offload_bundler: PathBuf,
    objcopy: PathBuf,
    tmp_dir: Option<PathBuf>,
}

impl Toolchain {
    /// Resolve tool locations, preferring explicit paths over `$PATH`.
    pub fn new(
        clang_offload_bundler: Option<PathBuf>,
        objcopy: Option<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            clang_offload_bundler: Self::find_tool("clang-offload-bundler", clang_offload_bundler)?,
            objcopy: Self::find_tool("objcopy", objcopy)?,
            tmp_dir: None,
        })
    }

    /// Scratch directory handed to child processes through `TMPDIR`.
    pub fn with_tmp_dir(mut self, tmp_dir: Option<PathBuf>) -> Self {
        self.tmp_dir = tmp_dir;
        self
    }

    pub fn clang_offload_bundler(&self) -> &Path {
        &self.clang_offload_bundler
    }

    pub fn objcopy(&self) -> &Path {
        &self.objcopy
    }

    fn find_tool(name: &str, explicit: Option<PathBuf>) -> Result<PathBuf> {
        let path = match explicit {
            Some(path) => path,
            None => which::which(name).context(ToolNotFoundSnafu { name })?,
        };
        ensure!(path.exists(), ToolMissingSnafu { name, path });
        Ok(path)
    }

    /// Run a tool with stderr merged into the captured output, so failure
    /// diagnostics survive for signature checks.
    fn run(&self, tool: &Path, args: Vec<OsString>) -> Result<(bool, String)> {
        debug!("running {} {:?}", tool.display(), args);
        let mut expression = duct::cmd(tool, args)
            .stderr_to_stdout()
            .stdout_capture()
            .unchecked();
        if let Some(dir) = &self.tmp_dir {
            expression = expression.env("TMPDIR", dir);
        }
        let output = expression.run().context(SpawnSnafu {
            tool: tool.display().to_string(),
        })?;
        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ))
    }

    fn run_bundler(&self, args: Vec<OsString>) -> Result<String> {
        let (success, merged) = self.run(&self.clang_offload_bundler, args)?;
        ensure!(success, BundlerFailedSnafu { stderr: merged });
        Ok(merged)
    }

    fn run_objcopy(&self, args: Vec<OsString>) -> Result<String> {
        let (success, merged) = self.run(&self.objcopy, args)?;
        ensure!(success, ObjcopyFailedSnafu { stderr: merged });
        Ok(merged)
    }

    /// List the target triples bundled in `input`.
    pub fn list_targets(&self, input: &Path) -> Result<Vec<String>> {
        let output = self.run_bundler(vec![
            "--list".into(),
            "--type=o".into(),
            arg("--input=", input),
        ])?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Extract the named targets from `input`, one output path per target.
    pub fn unbundle(&self, input: &Path, targets: &[String], outputs: &[PathBuf]) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let mut args = vec![
            "--unbundle".into(),
            "--type=o".into(),
            arg("--input=", input),
            OsString::from(format!("--targets={}", targets.join(","))),
        ];
        for output in outputs {
            args.push("--output".into());
            args.push(output.as_os_str().to_os_string());
        }
        self.run_bundler(args)?;
        Ok(())
    }

    /// `objcopy --add-section <section>=<content>` from `input` to `output`.
    pub fn add_section(
        &self,
        input: &Path,
        output: &Path,
        section: &str,
        content: &Path,
    ) -> Result<()> {
        self.run_objcopy(vec![
            "--add-section".into(),
            arg(&format!("{section}="), content),
            input.as_os_str().to_os_string(),
            output.as_os_str().to_os_string(),
        ])?;
        Ok(())
    }

    /// `objcopy --dump-section <section>=<output>` from `input`.
    pub fn dump_section(&self, input: &Path, section: &str, output: &Path) -> Result<()> {
        self.run_objcopy(vec![
            "--dump-section".into(),
            arg(&format!("{section}="), output),
            input.as_os_str().to_os_string(),
        ])?;
        Ok(())
    }

    /// `objcopy --remove-section <section>` from `input` to `output`. Note
    /// that this drops only the headers; reclaiming the payload's space is
    /// the ELF rewriter's job.
    pub fn remove_section(&self, input: &Path, output: &Path, section: &str) -> Result<()> {
        self.run_objcopy(vec![
            "--remove-section".into(),
            OsString::from(section),
            input.as_os_str().to_os_string(),
            output.as_os_str().to_os_string(),
        ])?;
        Ok(())
    }

    /// Section names of an ELF file, parsed natively.
    pub fn list_elf_sections(path: &Path) -> Result<Vec<String>> {
        let data = std::fs::read(path).context(ReadBinarySnafu { path })?;
        let elf = goblin::elf::Elf::parse(&data).context(ParseElfSnafu { path })?;
        Ok(elf
            .section_headers
            .iter()
            .filter_map(|sh| elf.shdr_strtab.get_at(sh.sh_name))
            .map(str::to_string)
            .collect())
    }
}

fn arg(prefix: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(prefix);
    arg.push(path.as_os_str());
    arg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decompression_bug_signature() {
        assert!(is_decompression_bug(
            "error: Failed to decompress input: src size is incorrect"
        ));
        assert!(is_decompression_bug("zstd Decompress error"));
        assert!(!is_decompression_bug("error: no such target gfx9999"));
    }

    #[test]
    fn explicit_tool_path_must_exist() {
        let missing = PathBuf::from("/does/not/exist/clang-offload-bundler");
        let err = Toolchain::find_tool("clang-offload-bundler", Some(missing)).unwrap_err();
        assert!(matches!(err, Error::ToolMissing { .. }));
    }
}
