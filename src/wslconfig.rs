// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! WSL global configuration patching.
//!
//! WSL reads global settings for every WSL 2 distribution from `.wslconfig`
//! in the user's home directory. The file is INI-like: `[section]` headers
//! followed by `key = value` lines, with `#` or `;` comments.
//!
//! NixOS-WSL boots systemd, which needs the guest kernel to be started with a
//! specific command line option. WSL only exposes this through the
//! `kernelCommandLine` key of the `[wsl2]` section. This module injects that
//! option while leaving every unrelated line of the file untouched.
//!
//! # Patch Rules
//!
//! - No `[wsl2]` section: append a new section holding the key.
//! - Section without the key: insert the key right after the header.
//! - Key present, but without the option: replace the line in place, and drop
//!   any further copies of the key in the same section.
//! - Key already holds the option: nothing changes, the file is left byte for
//!   byte as it was.
//!
//! # Encoding
//!
//! Notepad and Windows PowerShell happily save the file as UTF-8 with a byte
//! order mark, or as UTF-16LE. Both are understood, and a patched file is
//! written back in the encoding it was read in.
//!
//! # See Also
//!
//! - [WSL configuration](https://learn.microsoft.com/en-us/windows/wsl/wsl-config)

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{copy, read, write},
    io::{Error as IoError, ErrorKind},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

const SECTION: &str = "wsl2";
const KEY: &str = "kernelCommandLine";
const BOM: char = '\u{feff}';
const UTF16LE_BOM: [u8; 2] = [0xff, 0xfe];

/// Manage `.wslconfig` file on disk.
#[derive(Clone, Debug)]
pub struct WslConfigDrafter {
    path: PathBuf,
}

impl WslConfigDrafter {
    /// Construct new drafter for given configuration file path.
    ///
    /// The file does not need to exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of configuration file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path backup copy is written to before patching.
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| ".wslconfig".into());
        name.push(".bak");
        self.path.with_file_name(name)
    }

    /// Check if kernel command line option is already configured.
    ///
    /// # Errors
    ///
    /// - Return [`WslConfigError::Read`] if file exists but cannot be read.
    pub fn is_patched(&self, option: &str) -> Result<bool> {
        let (content, _) = self.read()?;
        Ok(WslConfigEdit::from(content.as_str()).has_kernel_option(option))
    }

    /// Inject kernel command line option into configuration file.
    ///
    /// Backs up the existing file before writing the patched version. Does
    /// nothing at all if the option is already present.
    ///
    /// # Errors
    ///
    /// - Return [`WslConfigError::Read`] if file cannot be read.
    /// - Return [`WslConfigError::Backup`] if backup copy cannot be written.
    /// - Return [`WslConfigError::Write`] if patched file cannot be written.
    #[instrument(skip(self), level = "debug")]
    pub fn patch(&self, option: &str) -> Result<bool> {
        let (content, encoding) = self.read()?;
        let mut edit = WslConfigEdit::from(content.as_str());
        edit.ensure_kernel_option(option);

        if !edit.changed {
            debug!("{:?} already sets {KEY} to {option:?}", self.path.display());
            return Ok(false);
        }

        if self.path.exists() {
            let backup = self.backup_path();
            info!("back up {:?} to {:?}", self.path.display(), backup.display());
            copy(&self.path, &backup).map_err(|err| WslConfigError::Backup {
                source: err,
                path: backup.clone(),
            })?;
        }

        info!("set {KEY} = {option} in {:?}", self.path.display());
        let bytes = encoding.encode(&edit.to_string());
        write(&self.path, bytes).map_err(|err| WslConfigError::Write {
            source: err,
            path: self.path.clone(),
        })?;

        Ok(true)
    }

    fn read(&self) -> Result<(String, FileEncoding)> {
        let bytes = match read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok((String::new(), FileEncoding::Utf8))
            }
            Err(err) => {
                return Err(WslConfigError::Read {
                    source: err,
                    path: self.path.clone(),
                })
            }
        };

        FileEncoding::decode(&bytes).ok_or_else(|| WslConfigError::Read {
            source: IoError::new(
                ErrorKind::InvalidData,
                "file is neither UTF-8 nor UTF-16LE text",
            ),
            path: self.path.clone(),
        })
    }
}

/// Text encoding of `.wslconfig` on disk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FileEncoding {
    /// UTF-8, with or without byte order mark.
    #[default]
    Utf8,

    /// UTF-16LE with byte order mark.
    Utf16Le,
}

impl FileEncoding {
    /// Decode raw file content, detecting its encoding.
    ///
    /// A UTF-8 byte order mark is kept in the returned text. Returns `None`
    /// if content is not valid text in either encoding.
    pub fn decode(bytes: &[u8]) -> Option<(String, Self)> {
        let Some(rest) = bytes.strip_prefix(&UTF16LE_BOM[..]) else {
            return String::from_utf8(bytes.to_vec())
                .ok()
                .map(|text| (text, Self::Utf8));
        };

        if rest.len() % 2 != 0 {
            return None;
        }

        let units = rest
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>();
        String::from_utf16(&units)
            .ok()
            .map(|text| (text, Self::Utf16Le))
    }

    /// Encode text for writing back to disk.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Utf16Le => UTF16LE_BOM
                .into_iter()
                .chain(text.encode_utf16().flat_map(u16::to_le_bytes))
                .collect(),
        }
    }
}

/// In-memory editor of `.wslconfig` content.
///
/// # Invariant
///
/// - Lines outside the edited key are preserved verbatim.
/// - Original line ending style is kept.
/// - A leading byte order mark is kept.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WslConfigEdit {
    bom: bool,
    lines: Vec<String>,
    line_ending: &'static str,
    trailing_newline: bool,
    changed: bool,
}

impl WslConfigEdit {
    /// Check if edit changed anything.
    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Check if `[wsl2]` section's kernel command line holds option.
    pub fn has_kernel_option(&self, option: &str) -> bool {
        let Some((start, end)) = self.section_bounds() else {
            return false;
        };

        self.lines[start..end]
            .iter()
            .filter_map(|line| key_value(line))
            .any(|(key, value)| {
                key.eq_ignore_ascii_case(KEY) && value.split_whitespace().any(|arg| arg == option)
            })
    }

    /// Make sure `[wsl2]` section's kernel command line holds option.
    pub fn ensure_kernel_option(&mut self, option: &str) {
        if self.has_kernel_option(option) {
            return;
        }

        let wanted = format!("{KEY} = {option}");
        let Some((start, end)) = self.section_bounds() else {
            if self.lines.last().is_some_and(|line| !line.trim().is_empty()) {
                self.lines.push(String::new());
            }
            self.lines.push(format!("[{SECTION}]"));
            self.lines.push(wanted);
            self.trailing_newline = true;
            self.changed = true;
            return;
        };

        let existing = (start..end)
            .filter(|index| {
                key_value(&self.lines[*index]).is_some_and(|(key, _)| key.eq_ignore_ascii_case(KEY))
            })
            .collect::<Vec<_>>();

        match existing.split_first() {
            Some((first, rest)) => {
                self.lines[*first] = wanted;
                // INVARIANT: Remove from the back so earlier indices stay valid.
                for index in rest.iter().rev() {
                    self.lines.remove(*index);
                }
            }
            None => self.lines.insert(start, wanted),
        }

        self.changed = true;
    }

    /// Locate body of `[wsl2]` section as half-open line range.
    fn section_bounds(&self) -> Option<(usize, usize)> {
        let header = self
            .lines
            .iter()
            .position(|line| section_name(line).is_some_and(|name| name.eq_ignore_ascii_case(SECTION)))?;

        let start = header + 1;
        let end = self.lines[start..]
            .iter()
            .position(|line| section_name(line).is_some())
            .map(|offset| start + offset)
            .unwrap_or(self.lines.len());

        Some((start, end))
    }
}

impl Display for WslConfigEdit {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        let mut out = if self.bom { BOM.to_string() } else { String::new() };
        out.push_str(self.lines.join(self.line_ending).as_str());
        if self.trailing_newline && !self.lines.is_empty() {
            out.push_str(self.line_ending);
        }

        write!(fmt, "{out}")
    }
}

impl From<&str> for WslConfigEdit {
    fn from(content: &str) -> Self {
        let (bom, content) = match content.strip_prefix(BOM) {
            Some(rest) => (true, rest),
            None => (false, content),
        };
        let line_ending = if content.contains("\r\n") { "\r\n" } else { "\n" };

        Self {
            bom,
            lines: content.lines().map(str::to_owned).collect(),
            line_ending,
            trailing_newline: content.ends_with('\n'),
            changed: false,
        }
    }
}

fn section_name(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .map(str::trim)
}

fn key_value(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.starts_with('#') || line.starts_with(';') {
        return None;
    }

    line.split_once('=')
        .map(|(key, value)| (key.trim(), value.trim()))
}

/// `.wslconfig` manipulation errors.
#[derive(Debug, thiserror::Error)]
pub enum WslConfigError {
    #[error("failed to read {path:?}")]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to back up WSL configuration to {path:?}")]
    Backup {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to write {path:?}")]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
type Result<T, E = WslConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::fs::read_to_string;

    const OPTION: &str = "cgroup_no_v1=all";

    fn patched(content: &str) -> (String, bool) {
        let mut edit = WslConfigEdit::from(content);
        edit.ensure_kernel_option(OPTION);
        (edit.to_string(), edit.changed())
    }

    #[test]
    fn append_section_when_missing() {
        let (result, changed) = patched(indoc! {"
            [experimental]
            autoMemoryReclaim = gradual
        "});

        let expect = indoc! {"
            [experimental]
            autoMemoryReclaim = gradual

            [wsl2]
            kernelCommandLine = cgroup_no_v1=all
        "};

        assert!(changed);
        assert_eq!(result, expect);
        assert_eq!(result.matches("[wsl2]").count(), 1);
        assert_eq!(result.matches("kernelCommandLine").count(), 1);
    }

    #[test]
    fn create_content_from_empty_file() {
        let (result, changed) = patched("");
        assert!(changed);
        assert_eq!(result, "[wsl2]\nkernelCommandLine = cgroup_no_v1=all\n");
    }

    #[test]
    fn insert_key_into_existing_section() {
        let (result, _) = patched(indoc! {"
            [wsl2]
            memory = 8GB
            swap = 0

            [experimental]
            sparseVhd = true
        "});

        let expect = indoc! {"
            [wsl2]
            kernelCommandLine = cgroup_no_v1=all
            memory = 8GB
            swap = 0

            [experimental]
            sparseVhd = true
        "};

        assert_eq!(result, expect);
    }

    #[test]
    fn replace_key_with_different_value() {
        let (result, changed) = patched(indoc! {"
            [wsl2]
            memory = 8GB
            kernelCommandLine = quiet
            # kernelCommandLine = commented out
            kernelCommandLine=vsyscall=emulate
        "});

        let expect = indoc! {"
            [wsl2]
            memory = 8GB
            kernelCommandLine = cgroup_no_v1=all
            # kernelCommandLine = commented out
        "};

        assert!(changed);
        assert_eq!(result, expect);
    }

    #[test]
    fn leave_satisfied_content_untouched() {
        let content = "[WSL2]\r\nkernelCommandLine =  quiet cgroup_no_v1=all \r\nmemory=4GB";
        let (result, changed) = patched(content);

        assert!(!changed);
        assert_eq!(result, content);
    }

    #[test]
    fn key_outside_section_does_not_count() {
        let content = indoc! {"
            [experimental]
            kernelCommandLine = cgroup_no_v1=all
        "};

        assert!(!WslConfigEdit::from(content).has_kernel_option(OPTION));
    }

    #[test]
    fn keep_crlf_line_endings() {
        let (result, _) = patched("[wsl2]\r\nmemory = 8GB\r\n");
        assert_eq!(
            result,
            "[wsl2]\r\nkernelCommandLine = cgroup_no_v1=all\r\nmemory = 8GB\r\n"
        );
    }

    #[test]
    fn byte_order_mark_does_not_hide_first_section() {
        let (result, changed) = patched("\u{feff}[wsl2]\nmemory = 8GB\n");

        assert!(changed);
        assert_eq!(
            result,
            "\u{feff}[wsl2]\nkernelCommandLine = cgroup_no_v1=all\nmemory = 8GB\n"
        );
        assert_eq!(result.matches("[wsl2]").count(), 1);
    }

    #[test]
    fn decode_detects_utf16le() {
        let bytes = FileEncoding::Utf16Le.encode("[wsl2]\r\n");
        assert_eq!(&bytes[..4], &[0xff, 0xfe, b'[', 0x00]);
        assert_eq!(
            FileEncoding::decode(&bytes),
            Some(("[wsl2]\r\n".to_string(), FileEncoding::Utf16Le))
        );
        assert_eq!(
            FileEncoding::decode(b"[wsl2]\n"),
            Some(("[wsl2]\n".to_string(), FileEncoding::Utf8))
        );
        assert_eq!(FileEncoding::decode(&[0xff, 0xfe, b'[']), None);
        assert_eq!(FileEncoding::decode(&[0xc3, 0x28]), None);
    }

    #[test]
    fn drafter_keeps_utf8_byte_order_mark() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(".wslconfig");
        write(&path, "\u{feff}[wsl2]\r\nmemory = 8GB\r\n")?;

        let drafter = WslConfigDrafter::new(&path);
        assert!(!drafter.is_patched(OPTION)?);
        assert!(drafter.patch(OPTION)?);
        assert!(drafter.is_patched(OPTION)?);
        assert_eq!(
            read_to_string(&path)?,
            "\u{feff}[wsl2]\r\nkernelCommandLine = cgroup_no_v1=all\r\nmemory = 8GB\r\n"
        );

        Ok(())
    }

    #[test]
    fn drafter_writes_utf16le_file_back_as_utf16le() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(".wslconfig");
        let original = FileEncoding::Utf16Le.encode("[wsl2]\r\nmemory = 8GB\r\n");
        write(&path, &original)?;

        let drafter = WslConfigDrafter::new(&path);
        assert!(!drafter.is_patched(OPTION)?);
        assert!(drafter.patch(OPTION)?);
        assert!(drafter.is_patched(OPTION)?);

        assert_eq!(read(drafter.backup_path())?, original);
        assert_eq!(
            read(&path)?,
            FileEncoding::Utf16Le
                .encode("[wsl2]\r\nkernelCommandLine = cgroup_no_v1=all\r\nmemory = 8GB\r\n")
        );

        let patched = read(&path)?;
        assert!(!drafter.patch(OPTION)?);
        assert_eq!(read(&path)?, patched);

        Ok(())
    }

    #[test]
    fn drafter_rejects_undecodable_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(".wslconfig");
        write(&path, [0xff, 0xfe, b'['])?;

        let result = WslConfigDrafter::new(&path).patch(OPTION);
        assert!(matches!(
            result,
            Err(WslConfigError::Read { ref source, .. }) if source.kind() == ErrorKind::InvalidData
        ));

        Ok(())
    }

    #[test]
    fn drafter_backs_up_then_patches() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(".wslconfig");
        write(&path, "[wsl2]\nmemory = 8GB\n")?;

        let drafter = WslConfigDrafter::new(&path);
        assert!(!drafter.is_patched(OPTION)?);
        assert!(drafter.patch(OPTION)?);
        assert!(drafter.is_patched(OPTION)?);

        assert_eq!(read_to_string(drafter.backup_path())?, "[wsl2]\nmemory = 8GB\n");
        assert_eq!(
            read_to_string(&path)?,
            "[wsl2]\nkernelCommandLine = cgroup_no_v1=all\nmemory = 8GB\n"
        );

        Ok(())
    }

    #[test]
    fn drafter_leaves_patched_file_byte_identical() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(".wslconfig");
        let content = "# mine\n[wsl2]\nkernelCommandLine = cgroup_no_v1=all";
        write(&path, content)?;

        let drafter = WslConfigDrafter::new(&path);
        assert!(!drafter.patch(OPTION)?);
        assert_eq!(read_to_string(&path)?, content);
        assert!(!drafter.backup_path().exists());

        Ok(())
    }

    #[test]
    fn drafter_creates_missing_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let drafter = WslConfigDrafter::new(dir.path().join(".wslconfig"));

        assert!(!drafter.is_patched(OPTION)?);
        assert!(drafter.patch(OPTION)?);
        assert!(!drafter.backup_path().exists());
        assert!(drafter.is_patched(OPTION)?);

        Ok(())
    }
}
