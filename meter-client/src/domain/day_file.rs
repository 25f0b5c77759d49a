use std::path::PathBuf;

use chrono::{Datelike, NaiveDate};

use super::{site::SiteId, SourceKind};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("not a day file name: {0}")]
pub struct DayFileNameError(pub String);

/// Identity of one day file: `(site, day, source kind)`.
///
/// Files live at `<YYYY>/<MM>/<YYYY>_<MM>_<DD>_<site>_<kind>.csv` below the
/// site's data directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DayFileKey {
    pub site_id: SiteId,
    pub day: NaiveDate,
    pub kind: SourceKind,
}

impl DayFileKey {
    pub fn new(site_id: SiteId, day: NaiveDate, kind: SourceKind) -> Self {
        Self { site_id, day, kind }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{:04}_{:02}_{:02}_{}_{}.csv",
            self.day.year(),
            self.day.month(),
            self.day.day(),
            self.site_id,
            self.kind.file_tag()
        )
    }

    /// Directory of the file relative to the data root.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(format!("{:04}", self.day.year())).join(format!("{:02}", self.day.month()))
    }

    pub fn relative_path(&self) -> PathBuf {
        self.relative_dir().join(self.file_name())
    }

    /// Parses a bare file name. Site ids may themselves contain underscores,
    /// so the date is taken from the front and the kind from the back.
    pub fn parse_file_name(name: &str) -> Result<Self, DayFileNameError> {
        let err = || DayFileNameError(name.to_string());

        let stem = name.strip_suffix(".csv").ok_or_else(err)?;
        let mut parts = stem.splitn(4, '_');
        let year: i32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let month: u32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let day: u32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let rest = parts.next().ok_or_else(err)?;

        let (site, tag) = rest.rsplit_once('_').ok_or_else(err)?;
        if site.is_empty() {
            return Err(err());
        }
        let kind = SourceKind::from_file_tag(tag).ok_or_else(err)?;
        let day = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(err)?;

        Ok(Self {
            site_id: SiteId::new(site),
            day,
            kind,
        })
    }
}
