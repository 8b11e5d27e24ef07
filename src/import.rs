use anyhow::{Context, Result};
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use crate::models::ActivityRecord;

/// CSV importer for synced activities with flexible column naming
///
/// Canonical header: `id,user_id,date,duration_seconds,distance_m,elevation_gain_m,avg_hr,max_hr`
pub struct CsvImporter {
    column_mapping: HashMap<String, String>,
    default_user: Option<String>,
}

impl Default for CsvImporter {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvImporter {
    pub fn new() -> Self {
        let mut column_mapping = HashMap::new();

        Self::add_mapping(&mut column_mapping, "id", &["id", "activity_id", "external_id"]);
        Self::add_mapping(&mut column_mapping, "user_id", &["user_id", "user", "athlete", "athlete_id"]);
        Self::add_mapping(&mut column_mapping, "date", &["date", "day", "start_date", "activity_date"]);
        Self::add_mapping(
            &mut column_mapping,
            "duration_seconds",
            &["duration_seconds", "duration", "moving_time", "elapsed_time", "seconds"],
        );
        Self::add_mapping(
            &mut column_mapping,
            "distance_m",
            &["distance_m", "distance", "distance_meters", "meters"],
        );
        Self::add_mapping(
            &mut column_mapping,
            "elevation_gain_m",
            &["elevation_gain_m", "elevation_gain", "elevation", "total_elevation_gain", "climb"],
        );
        Self::add_mapping(
            &mut column_mapping,
            "avg_hr",
            &["avg_hr", "average_heartrate", "avg_heart_rate", "heart_rate", "hr"],
        );
        Self::add_mapping(
            &mut column_mapping,
            "max_hr",
            &["max_hr", "max_heartrate", "max_heart_rate"],
        );

        Self {
            column_mapping,
            default_user: None,
        }
    }

    /// Assign rows without a user column to this user
    pub fn with_default_user(mut self, user_id: impl Into<String>) -> Self {
        self.default_user = Some(user_id.into());
        self
    }

    fn add_mapping(mapping: &mut HashMap<String, String>, standard: &str, variations: &[&str]) {
        for variation in variations {
            mapping.insert(variation.to_lowercase(), standard.to_string());
        }
    }

    fn normalize_column_name(&self, name: &str) -> String {
        let normalized = name.trim().to_lowercase().replace([' ', '-'], "_");
        self.column_mapping
            .get(&normalized)
            .cloned()
            .unwrap_or(normalized)
    }

    fn parse_date(value: &str) -> Result<NaiveDate> {
        let formats = ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%SZ"];
        let value = value.trim();
        for format in &formats {
            if let Ok(date) = NaiveDate::parse_from_str(value, format) {
                return Ok(date);
            }
            if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(value, format) {
                return Ok(dt.date());
            }
        }
        anyhow::bail!("Unable to parse date: {}", value);
    }

    pub fn import_file(&self, path: &Path) -> Result<Vec<ActivityRecord>> {
        let file = std::fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        self.import_reader(file)
            .with_context(|| format!("Failed to import {}", path.display()))
    }

    pub fn import_reader<R: Read>(&self, reader: R) -> Result<Vec<ActivityRecord>> {
        let mut csv_reader = ReaderBuilder::new().has_headers(true).trim(csv::Trim::All).from_reader(reader);

        let headers: Vec<String> = csv_reader
            .headers()?
            .iter()
            .map(|h| self.normalize_column_name(h))
            .collect();
        let index: HashMap<&str, usize> = headers.iter().enumerate().map(|(i, h)| (h.as_str(), i)).collect();

        for required in ["id", "date", "duration_seconds"] {
            if !index.contains_key(required) {
                anyhow::bail!("CSV is missing required column '{}'", required);
            }
        }
        if !index.contains_key("user_id") && self.default_user.is_none() {
            anyhow::bail!("CSV has no user column and no default user was given");
        }

        let mut records = Vec::new();
        for (row_number, row) in csv_reader.records().enumerate() {
            let row = row?;
            let record = self
                .parse_row(&row, &index)
                .with_context(|| format!("Invalid row {}", row_number + 2))?;
            records.push(record);
        }

        tracing::info!(rows = records.len(), "CSV activities parsed");
        Ok(records)
    }

    fn parse_row(&self, row: &StringRecord, index: &HashMap<&str, usize>) -> Result<ActivityRecord> {
        let field = |name: &str| -> Option<&str> {
            index
                .get(name)
                .and_then(|i| row.get(*i))
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let id = field("id").context("empty id")?.to_string();
        let user_id = match field("user_id") {
            Some(user) => user.to_string(),
            None => self.default_user.clone().context("empty user_id")?,
        };
        let date = Self::parse_date(field("date").context("empty date")?)?;
        let duration_seconds: u32 = field("duration_seconds")
            .context("empty duration")?
            .parse::<Decimal>()
            .context("invalid duration")?
            .round()
            .try_into()
            .context("duration out of range")?;

        let decimal = |name: &str| -> Result<Option<Decimal>> {
            field(name)
                .map(|v| v.parse::<Decimal>().with_context(|| format!("invalid {name}: {v}")))
                .transpose()
        };
        let heart_rate = |name: &str| -> Result<Option<u16>> {
            match decimal(name)? {
                None => Ok(None),
                Some(v) if v <= Decimal::ZERO => Ok(None),
                Some(v) => Ok(Some(v.round().try_into().with_context(|| format!("invalid {name}"))?)),
            }
        };

        Ok(ActivityRecord {
            id,
            user_id,
            date,
            duration_seconds,
            distance_meters: decimal("distance_m")?,
            elevation_gain_meters: decimal("elevation_gain_m")?,
            avg_heart_rate: heart_rate("avg_hr")?,
            max_heart_rate: heart_rate("max_hr")?,
            trimp: None,
            external_load: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_canonical_header() {
        let csv = "id,user_id,date,duration_seconds,distance_m,elevation_gain_m,avg_hr,max_hr\n\
                   a1,u1,2024-03-01,3600,10000,250,145,172\n\
                   a2,u1,2024-03-02,1800,5000,,,\n";
        let records = CsvImporter::new().import_reader(csv.as_bytes()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].distance_meters, Some(dec!(10000)));
        assert_eq!(records[0].avg_heart_rate, Some(145));
        assert_eq!(records[1].elevation_gain_meters, None);
        assert_eq!(records[1].avg_heart_rate, None);
    }

    #[test]
    fn test_column_aliases_and_default_user() {
        let csv = "Activity ID,Start Date,Moving Time,Distance,Average Heartrate\n\
                   x9,2024-03-01T07:30:00,2700.4,8000.5,151\n";
        let records = CsvImporter::new()
            .with_default_user("runner")
            .import_reader(csv.as_bytes())
            .unwrap();

        let record = &records[0];
        assert_eq!(record.user_id, "runner");
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(record.duration_seconds, 2700);
        assert_eq!(record.distance_meters, Some(dec!(8000.5)));
        assert_eq!(record.avg_heart_rate, Some(151));
    }

    #[test]
    fn test_missing_required_column() {
        let csv = "id,user_id,duration_seconds\na1,u1,60\n";
        let err = CsvImporter::new().import_reader(csv.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("date"));
    }

    #[test]
    fn test_bad_row_reports_line() {
        let csv = "id,user_id,date,duration_seconds\na1,u1,not-a-date,60\n";
        let err = CsvImporter::new().import_reader(csv.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("row 2"));
    }

    #[test]
    fn test_import_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "id,user_id,date,duration_seconds").unwrap();
        writeln!(file, "a1,u1,2024-03-01,600").unwrap();
        let records = CsvImporter::new().import_file(file.path()).unwrap();
        assert_eq!(records.len(), 1);
    }
}
