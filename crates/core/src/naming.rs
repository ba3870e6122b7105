//! Output path naming for result images.
//!
//! When a node yields a single image it is written to the requested
//! path unchanged. When it yields several, each gets an index suffix
//! inserted before the extension: `out.png` becomes `out_0.png`,
//! `out_1.png`, ...

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Split a file name at its last extension separator.
///
/// Leading dots do not start an extension, so `.hidden` has no
/// extension while `archive.tar.gz` splits into `archive.tar` + `.gz`.
/// The returned extension includes the dot.
pub fn split_extension(file_name: &str) -> (&str, &str) {
    let stem_start = file_name.len() - file_name.trim_start_matches('.').len();
    match file_name[stem_start..].rfind('.') {
        Some(pos) => file_name.split_at(stem_start + pos),
        None => (file_name, ""),
    }
}

/// Path for image `index` of a multi-image result.
///
/// Convention: `{base}_{index}{ext}` in the same directory as `output`.
pub fn indexed_output_path(output: &Path, index: usize) -> PathBuf {
    let file_name = output
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (base, ext) = split_extension(&file_name);

    let mut name = OsString::from(base);
    name.push(format!("_{index}"));
    name.push(ext);
    output.with_file_name(name)
}

/// Destination paths for `count` images produced by one node.
pub fn output_paths(output: &Path, count: usize) -> Vec<PathBuf> {
    match count {
        0 => Vec::new(),
        1 => vec![output.to_path_buf()],
        _ => (0..count)
            .map(|index| indexed_output_path(output, index))
            .collect(),
    }
}
