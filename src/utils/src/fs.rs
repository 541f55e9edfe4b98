use std::io::Write;
use std::path::Path;

pub fn open_with_create_truncate<P: AsRef<Path>>(path: P) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
}

/// Dump raw tool output, one line per entry.
pub fn write_lines<P: AsRef<Path>>(path: P, lines: &[String]) -> std::io::Result<()> {
    let mut f = std::io::BufWriter::new(open_with_create_truncate(&path)?);
    for line in lines {
        writeln!(f, "{}", line)?;
    }
    f.flush()
}

/// Write `lines` to `dir/name` when an output directory was requested.
/// Failures are logged, a missing raw log never aborts a run.
pub fn save_raw_log(dir: Option<&Path>, name: &str, lines: &[String]) {
    if let Some(dir) = dir {
        let path = dir.join(name);
        if let Err(e) = write_lines(&path, lines) {
            log::warn!("failed to write raw log {}: {}", path.display(), e);
        }
    }
}
