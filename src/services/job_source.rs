use async_trait::async_trait;
use encoding_rs::UTF_8;
use std::collections::VecDeque;
use std::path::Path;

use crate::pipeline::error::JobSourceError;
use crate::pipeline::traits::JobSource;

/// Usernames read from a list file.
///
/// Accepts a bare list (one username per line) or a CSV file whose header has
/// a `username` column. UTF-8 and UTF-16 (either byte order) are recognised by
/// their byte order mark; without one the file is read as UTF-8. Blank rows
/// are skipped and a leading `@` is dropped.
pub struct FileJobSource {
    usernames: VecDeque<String>,
}

impl FileJobSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, JobSourceError> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        let (text, encoding, had_errors) = UTF_8.decode(&bytes);
        if had_errors {
            return Err(JobSourceError::Malformed(format!(
                "input is not valid {}",
                encoding.name()
            )));
        }
        Ok(Self {
            usernames: parse(&text)?,
        })
    }
}

fn parse(text: &str) -> Result<VecDeque<String>, JobSourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut column = None;
    let mut header_checked = false;
    let mut usernames = VecDeque::new();
    for record in reader.records() {
        let record = record.map_err(|e| JobSourceError::Malformed(e.to_string()))?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        if !header_checked {
            header_checked = true;
            column = record
                .iter()
                .position(|cell| cell.eq_ignore_ascii_case("username"));
            if column.is_some() {
                continue;
            }
        }
        let field = match column {
            Some(index) => record.get(index).ok_or_else(|| {
                let line = record.position().map_or(0, |p| p.line());
                JobSourceError::Malformed(format!("missing username column on line {line}"))
            })?,
            None => record.get(0).unwrap_or_default(),
        };
        let username = field.trim_start_matches('@');
        if !username.is_empty() {
            usernames.push_back(username.to_string());
        }
    }
    Ok(usernames)
}

#[async_trait]
impl JobSource for FileJobSource {
    async fn next(&mut self) -> Result<Option<String>, JobSourceError> {
        Ok(self.usernames.pop_front())
    }
}
