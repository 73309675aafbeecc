use std::io::{Cursor, Read};

/// Pull one file out of a monthly zip archive by its file name.
///
/// Directory prefixes inside the archive are ignored. Returns `Ok(None)` when
/// the archive has no such entry.
pub fn extract_entry(archive: &[u8], entry_name: &str) -> zip::result::ZipResult<Option<Vec<u8>>> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))?;

    for index in 0..zip.len() {
        let mut file = zip.by_index(index)?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let file_name = name.rsplit('/').next().unwrap_or(&name);
        if file_name != entry_name {
            continue;
        }

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        return Ok(Some(contents));
    }

    Ok(None)
}

#[cfg(test)]
pub(crate) fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("start zip entry");
        writer.write_all(body).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_the_named_entry_only() {
        let zip = build_zip(&[
            ("20251109realtime_zone.csv", b"day nine"),
            ("nested/20251110realtime_zone.csv", b"day ten"),
        ]);

        let found = extract_entry(&zip, "20251110realtime_zone.csv").expect("read zip");
        assert_eq!(found.as_deref(), Some(&b"day ten"[..]));

        let missing = extract_entry(&zip, "20251111realtime_zone.csv").expect("read zip");
        assert!(missing.is_none());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(extract_entry(b"not a zip", "x.csv").is_err());
    }
}
