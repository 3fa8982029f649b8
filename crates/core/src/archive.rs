//! Zip sniffing, extraction and reads that cross archive boundaries

use crate::error::{ContentError, Result};
use crate::path::{normalize_segments, relative_string, ContentEntry, ContentFilter};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Cursor, Read, Seek};
use std::path::Path;
use tracing::debug;
use zip::ZipArchive;

/// Upper bound on buffer space reserved from an entry's declared size
const MAX_PREALLOC: u64 = 1024 * 1024;

/// Zip local file header signature
pub const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

/// Check the leading bytes for the zip signature
pub fn is_archive_bytes(data: &[u8]) -> bool {
    data.starts_with(&ZIP_MAGIC)
}

/// Sniff a file for the zip signature. The file name is never consulted.
pub fn is_archive(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => magic == ZIP_MAGIC,
        Err(_) => false,
    }
}

/// Open `path`, descending into archives for segments that lie past a file.
///
/// `path` must lie under `root`; for `a/b.zip/inner/c.txt` the file `a/b.zip`
/// is opened and `inner/c.txt` is read as an entry inside it. Nested archives
/// inside archives are followed the same way.
pub fn read_file(path: &Path, root: &Path) -> Result<Box<dyn Read + Send>> {
    let shown = relative_string(root, path);
    let segments = normalize_segments(&shown)?;

    let mut current = root.to_path_buf();
    for (i, segment) in segments.iter().enumerate() {
        current.push(segment);
        let metadata = match fs::metadata(&current) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ContentError::file_not_found(shown));
            }
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            continue;
        }

        let remaining = &segments[i + 1..];
        if remaining.is_empty() {
            return Ok(Box::new(File::open(&current)?));
        }
        if !is_archive(&current) {
            return Err(ContentError::file_not_found(shown));
        }

        debug!("Descending into archive {} for {}", current.display(), shown);
        let archive = ZipArchive::new(BufReader::new(File::open(&current)?))?;
        let data = read_archive_entry(archive, remaining, &shown)?;
        return Ok(Box::new(Cursor::new(data)));
    }

    Err(ContentError::file_not_found(shown))
}

/// Capacity to reserve for an entry; the declared size is not trusted
fn prealloc_len(declared: u64) -> usize {
    declared.min(MAX_PREALLOC) as usize
}

/// Find the entry named by `segments`, recursing into nested archives
fn read_archive_entry<R: Read + Seek>(
    mut archive: ZipArchive<R>,
    segments: &[String],
    shown: &str,
) -> Result<Vec<u8>> {
    for split in 1..=segments.len() {
        let name = segments[..split].join("/");
        let mut entry = match archive.by_name(&name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => continue,
            Err(e) => return Err(e.into()),
        };
        if entry.is_dir() {
            continue;
        }

        let mut data = Vec::with_capacity(prealloc_len(entry.size()));
        entry.read_to_end(&mut data)?;
        drop(entry);

        let remaining = &segments[split..];
        if remaining.is_empty() {
            return Ok(data);
        }
        if !is_archive_bytes(&data) {
            break;
        }
        let nested = ZipArchive::new(Cursor::new(data))?;
        return read_archive_entry(nested, remaining, shown);
    }

    Err(ContentError::file_not_found(shown))
}

/// Unpack the archive at `archive_path` into `target_dir`.
///
/// Entries whose names would land outside `target_dir` abort the extraction.
/// Returns the number of entries written.
pub fn extract(archive_path: &Path, target_dir: &Path) -> Result<usize> {
    if !is_archive(archive_path) {
        return Err(ContentError::NotAnArchive {
            path: archive_path.to_path_buf(),
        });
    }

    let mut archive = ZipArchive::new(BufReader::new(File::open(archive_path)?))?;
    fs::create_dir_all(target_dir)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| ContentError::traversal(entry.name()))?;
        let out_path = target_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out_file = File::create(&out_path)?;
        io::copy(&mut entry, &mut out_file)?;
    }

    debug!(
        "Extracted {} entries from {} into {}",
        archive.len(),
        archive_path.display(),
        target_dir.display()
    );
    Ok(archive.len())
}

/// List an archive's entries under `prefix` in path order, bounded by `filter`.
///
/// Paths and depths are relative to `prefix`. Directories implied by entry
/// names are reported even when the archive has no explicit entry for them.
pub fn list_entries(
    archive_path: &Path,
    prefix: &[String],
    filter: ContentFilter,
) -> Result<Vec<ContentEntry>> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(archive_path)?))?;
    let max_depth = filter.max_depth();
    let mut listed: BTreeMap<String, ContentEntry> = BTreeMap::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let full = normalize_segments(entry.name())?;
        if full.len() <= prefix.len() || !full.starts_with(prefix) {
            continue;
        }
        let segments = &full[prefix.len()..];

        let parents = if entry.is_dir() {
            segments.len()
        } else {
            segments.len() - 1
        };
        if !filter.files_only {
            for depth in 1..=parents.min(max_depth) {
                let dir = segments[..depth].join("/");
                listed
                    .entry(format!("{}/", dir))
                    .or_insert_with(|| ContentEntry::directory(dir));
            }
        }

        if entry.is_dir() || segments.len() > max_depth {
            continue;
        }
        if filter.archive_only {
            let mut magic = [0u8; 4];
            if entry.read_exact(&mut magic).is_err() || !is_archive_bytes(&magic) {
                continue;
            }
        }
        let path = segments.join("/");
        listed.insert(path.clone(), ContentEntry::file(path, entry.size()));
    }

    Ok(listed.into_values().collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Build a zip in memory from (name, contents); `None` contents add a directory
    pub(crate) fn zip_bytes(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, contents) in entries {
            match contents {
                Some(data) => {
                    writer.start_file(*name, options).unwrap();
                    writer.write_all(data).unwrap();
                }
                None => writer.add_directory(*name, options).unwrap(),
            }
        }
        writer.finish().unwrap().into_inner()
    }

    fn read_all(mut reader: Box<dyn Read + Send>) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_sniff_ignores_extension() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let disguised = dir.path().join("archive.txt");
        fs::write(&disguised, zip_bytes(&[("a.txt", Some(b"a"))]))?;
        let named = dir.path().join("plain.zip");
        fs::write(&named, b"just text")?;
        let tiny = dir.path().join("tiny.zip");
        fs::write(&tiny, b"PK")?;

        assert!(is_archive(&disguised));
        assert!(!is_archive(&named));
        assert!(!is_archive(&tiny));
        assert!(!is_archive(&dir.path().join("missing")));
        Ok(())
    }

    #[test]
    fn test_read_file_across_nested_archives() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let inner = zip_bytes(&[("deep/c.txt", Some(b"innermost"))]);
        let outer = zip_bytes(&[
            ("inner/", None),
            ("inner/c.txt", Some(b"hello")),
            ("lib/inner.jar", Some(&inner)),
        ]);
        fs::create_dir_all(dir.path().join("a"))?;
        fs::write(dir.path().join("a/b.zip"), outer)?;
        fs::write(dir.path().join("a/plain.txt"), b"plain")?;

        let root = dir.path();
        assert_eq!(read_all(read_file(&root.join("a/plain.txt"), root)?), b"plain");
        assert_eq!(read_all(read_file(&root.join("a/b.zip/inner/c.txt"), root)?), b"hello");
        assert_eq!(
            read_all(read_file(&root.join("a/b.zip/lib/inner.jar/deep/c.txt"), root)?),
            b"innermost"
        );
        Ok(())
    }

    #[test]
    fn test_read_file_missing_entries() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("b.zip"), zip_bytes(&[("x.txt", Some(b"x"))]))?;
        fs::write(dir.path().join("plain.txt"), b"plain")?;
        let root = dir.path();

        for missing in ["b.zip/y.txt", "plain.txt/x.txt", "nope.txt", "b.zip/x.txt/more"] {
            let result = read_file(&root.join(missing), root);
            assert!(
                matches!(result, Err(ContentError::FileNotFound { .. })),
                "expected FileNotFound for {}",
                missing
            );
        }
        Ok(())
    }

    #[test]
    fn test_extract_and_list() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("app.war");
        let nested = zip_bytes(&[("x", Some(b"x"))]);
        fs::write(
            &archive,
            zip_bytes(&[
                ("empty/", None),
                ("index.html", Some(b"<html/>")),
                ("WEB-INF/lib/dep.jar", Some(&nested)),
            ]),
        )?;

        let target = dir.path().join("out");
        assert_eq!(extract(&archive, &target)?, 3);
        assert!(target.join("empty").is_dir());
        assert_eq!(fs::read(target.join("index.html"))?, b"<html/>");
        assert!(is_archive(&target.join("WEB-INF/lib/dep.jar")));

        let all: Vec<String> = list_entries(&archive, &[], ContentFilter::all())?
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(
            all,
            vec!["WEB-INF/", "WEB-INF/lib/", "WEB-INF/lib/dep.jar", "empty/", "index.html"]
        );

        let top: Vec<String> = list_entries(&archive, &[], ContentFilter::new(1, false))?
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(top, vec!["WEB-INF/", "empty/", "index.html"]);

        let archives = list_entries(&archive, &[], ContentFilter::files(-1, true))?;
        assert_eq!(archives, vec![ContentEntry::file("WEB-INF/lib/dep.jar", nested.len() as u64)]);

        let under: Vec<String> = list_entries(&archive, &["WEB-INF".to_string()], ContentFilter::all())?
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(under, vec!["lib/", "lib/dep.jar"]);
        Ok(())
    }

    #[test]
    fn test_extract_rejects_non_archive() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let plain = dir.path().join("plain.zip");
        fs::write(&plain, b"text")?;
        assert!(matches!(
            extract(&plain, &dir.path().join("out")),
            Err(ContentError::NotAnArchive { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_prealloc_ignores_declared_size() {
        assert_eq!(prealloc_len(512), 512);
        assert_eq!(prealloc_len(u64::MAX), MAX_PREALLOC as usize);
    }

    #[test]
    fn test_read_file_logs_descent() -> anyhow::Result<()> {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("b.zip"), zip_bytes(&[("x.txt", Some(b"x"))]))?;
        let root = dir.path();
        assert_eq!(read_all(read_file(&root.join("b.zip/x.txt"), root)?), b"x");
        Ok(())
    }
}
