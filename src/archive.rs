/// Archive file modification times.
///
/// Hydstra keeps one archive file per site and data source, named
/// `<site>.<data source>` (e.g. `70105.A`), with `/` in well numbers stored
/// as `_`. The file's mtime is a cheap hint that a site has new data.

use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::model::HydstraError;

#[derive(Debug, Clone, PartialEq)]
pub struct SiteModTime {
    pub site: String,
    /// UTC, whole seconds.
    pub mod_time: NaiveDateTime,
}

/// Rounds half up to the nearest whole second.
fn nearest_second(t: DateTime<Utc>) -> NaiveDateTime {
    let secs = t.timestamp() + i64::from(t.timestamp_subsec_millis() >= 500);
    DateTime::<Utc>::from_timestamp(secs, 0)
        .unwrap_or(t)
        .naive_utc()
}

/// Modification times of the `data_source` archive files in `dir`,
/// optionally limited to `sites`. Sorted by site.
pub fn site_mod_times(
    dir: &Path,
    data_source: &str,
    sites: Option<&[String]>,
) -> Result<Vec<SiteModTime>, HydstraError> {
    let wanted: Option<Vec<String>> =
        sites.map(|s| s.iter().map(|site| site.trim().replace('/', "_")).collect());

    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let matches_source = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(data_source));
        if !matches_source || !path.is_file() {
            continue;
        }
        let Some(site) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(wanted) = &wanted {
            if !wanted.iter().any(|w| w == site) {
                continue;
            }
        }
        let modified: DateTime<Utc> = fs::metadata(&path)?.modified()?.into();
        found.push(SiteModTime {
            site: site.to_string(),
            mod_time: nearest_second(modified),
        });
    }
    found.sort_by(|a, b| a.site.cmp(&b.site));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn test_lists_matching_archive_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "70105.A");
        touch(dir.path(), "69607.a");
        touch(dir.path(), "69607.B");
        touch(dir.path(), "notes.txt");

        let found = site_mod_times(dir.path(), "A", None).unwrap();
        let sites: Vec<_> = found.iter().map(|f| f.site.as_str()).collect();
        assert_eq!(sites, vec!["69607", "70105"]);
        assert!(found.iter().all(|f| f.mod_time.and_utc().timestamp_subsec_nanos() == 0));
    }

    #[test]
    fn test_site_filter_maps_slashes() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "M35_0312.A");
        touch(dir.path(), "70105.A");
        let found = site_mod_times(dir.path(), "A", Some(&["M35/0312".to_string()])).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].site, "M35_0312");
    }

    #[test]
    fn test_mod_time_rounds_to_nearest_second() {
        let base = DateTime::<Utc>::from_timestamp(1_500_000_000, 0).unwrap();
        let late = base + chrono::Duration::milliseconds(600);
        let early = base + chrono::Duration::milliseconds(400);
        let half = base + chrono::Duration::milliseconds(500);
        assert_eq!(nearest_second(late), base.naive_utc() + chrono::Duration::seconds(1));
        assert_eq!(nearest_second(early), base.naive_utc());
        assert_eq!(nearest_second(half), base.naive_utc() + chrono::Duration::seconds(1));
    }

    #[test]
    fn test_file_mtime_is_rounded_up_past_half_second() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "70105.A");
        let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_millis(1_500_000_000_700);
        fs::File::options()
            .write(true)
            .open(dir.path().join("70105.A"))
            .unwrap()
            .set_modified(mtime)
            .unwrap();
        let found = site_mod_times(dir.path(), "A", None).unwrap();
        assert_eq!(
            found[0].mod_time,
            DateTime::<Utc>::from_timestamp(1_500_000_001, 0).unwrap().naive_utc()
        );
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let result = site_mod_times(Path::new("/nonexistent/hyd/archive"), "A", None);
        assert!(matches!(result, Err(HydstraError::Io(_))));
    }
}
