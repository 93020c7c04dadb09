//! The output file. We write into a memory-mapped temporary in the destination directory and
//! rename it over the target on success, so the user never observes a half-written binary.
//! SIGINT/SIGTERM unlink the temporary synchronously and exit.

use crate::error::Context as _;
use crate::error::Result;
use memmap2::MmapMut;
use memmap2::MmapOptions;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering;

/// The temporary output path, exposed to the signal handler. The handler only ever reads the
/// pointer and calls async-signal-safe functions.
static TMPFILE: AtomicPtr<libc::c_char> = AtomicPtr::new(std::ptr::null_mut());

extern "C" fn handle_fatal_signal(_signal: libc::c_int) {
    let path = TMPFILE.load(Ordering::Acquire);
    if !path.is_null() {
        unsafe { libc::unlink(path) };
    }
    unsafe { libc::_exit(1) };
}

pub(crate) fn install_signal_handlers() {
    let handler = handle_fatal_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

pub(crate) struct OutputFile {
    file: std::fs::File,
    pub(crate) buffer: MmapMut,
    tmp_path: PathBuf,
    final_path: PathBuf,
}

impl OutputFile {
    pub(crate) fn create(path: &Path, file_size: u64) -> Result<OutputFile> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "a.out".to_owned());
        let tmp_path = path.with_file_name(format!(".{file_name}.kestrel.tmp"));

        let mut open_options = std::fs::OpenOptions::new();
        std::os::unix::fs::OpenOptionsExt::custom_flags(&mut open_options, libc::O_CLOEXEC);
        let file = open_options
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("Failed to open `{}`", tmp_path.display()))?;
        file.set_len(file_size)
            .with_context(|| format!("Failed to size `{}`", tmp_path.display()))?;

        let buffer = unsafe { MmapOptions::new().map_mut(&file) }
            .with_context(|| format!("Failed to map `{}`", tmp_path.display()))?;

        publish_tmpfile(&tmp_path);

        Ok(OutputFile {
            file,
            buffer,
            tmp_path,
            final_path: path.to_owned(),
        })
    }

    /// Commits the output: unmap, mark executable, rename into place.
    pub(crate) fn close(self) -> Result {
        drop(self.buffer);
        make_executable(&self.file)?;
        drop(self.file);
        std::fs::rename(&self.tmp_path, &self.final_path).with_context(|| {
            format!(
                "Failed to rename `{}` to `{}`",
                self.tmp_path.display(),
                self.final_path.display()
            )
        })?;
        clear_tmpfile();
        Ok(())
    }
}

/// Removes a temporary that an aborted link left behind. Called from the driver's error path;
/// the signal handler does its own unlink.
pub(crate) fn remove_abandoned_tmpfile() {
    let path = TMPFILE.swap(std::ptr::null_mut(), Ordering::AcqRel);
    if !path.is_null() {
        unsafe { libc::unlink(path) };
        drop(unsafe { CString::from_raw(path) });
    }
}

fn publish_tmpfile(path: &Path) {
    if let Ok(cstr) = CString::new(path.as_os_str().as_bytes()) {
        let raw = cstr.into_raw();
        let old = TMPFILE.swap(raw, Ordering::AcqRel);
        if !old.is_null() {
            drop(unsafe { CString::from_raw(old) });
        }
    }
}

fn clear_tmpfile() {
    let old = TMPFILE.swap(std::ptr::null_mut(), Ordering::AcqRel);
    if !old.is_null() {
        drop(unsafe { CString::from_raw(old) });
    }
}

fn make_executable(file: &std::fs::File) -> Result {
    use std::os::unix::prelude::PermissionsExt;

    let mut permissions = file.metadata()?.permissions();
    let mut mode = PermissionsExt::mode(&permissions);
    // Grant execute wherever we have read permission.
    mode |= (mode & 0o444) >> 2;
    PermissionsExt::set_mode(&mut permissions, mode);
    file.set_permissions(permissions)?;
    Ok(())
}
