//! Raw and scrubbed shard files.
//!
//! A shard is a tab separated file whose first line names the columns. Cells use the snapshot
//! cell escaping, `\N` standing for null.

use std::io;
use std::path::{Path, PathBuf};

use deid::{bail, deid_error};
use deid::error::{DeidResult, ErrorKind};
use deid::identity::codec::{decode_row, encode_row};
use deid::types::{RawRecord, TableLayout};
use tracing::debug;

/// Extension of shard files. Other files in a table directory are ignored.
pub const SHARD_EXTENSION: &str = "tsv";

/// A shard read into memory.
#[derive(Debug)]
pub struct Shard {
    pub path: PathBuf,
    pub layout: TableLayout,
    pub records: Vec<RawRecord>,
}

/// Shard files of the table directory `directory`, in name order.
///
/// A missing directory holds no shards.
pub async fn list_shards(directory: &Path) -> DeidResult<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut shards = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_shard = path
            .extension()
            .is_some_and(|extension| extension == SHARD_EXTENSION);
        if is_shard && entry.file_type().await?.is_file() {
            shards.push(path);
        }
    }
    shards.sort();

    Ok(shards)
}

/// Table directories below `root`, in name order.
pub async fn list_tables(root: &Path) -> DeidResult<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut tables = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir()
            && let Some(name) = entry.file_name().to_str()
        {
            tables.push(name.to_string());
        }
    }
    tables.sort();

    Ok(tables)
}

/// Reads a shard of `table`.
///
/// Fails with [`ErrorKind::InvalidData`] when the header is missing or holds a null, or a row
/// is not as wide as the header. Errors name the file and line, never cell contents.
pub async fn read_shard(table: &str, path: &Path) -> DeidResult<Shard> {
    let contents = tokio::fs::read_to_string(path).await?;
    let mut lines = contents.lines();

    let Some(header) = lines.next() else {
        bail!(
            ErrorKind::InvalidData,
            "Shard has no header row",
            format!("{}", path.display())
        );
    };
    let mut columns = Vec::new();
    for column in decode_line(path, 1, header)? {
        let Some(column) = column else {
            bail!(
                ErrorKind::InvalidData,
                "Shard header holds a null column name",
                format!("{}:1", path.display())
            );
        };
        columns.push(column);
    }
    let layout = TableLayout::new(table, columns);

    let mut records = Vec::new();
    for (i, line) in lines.enumerate() {
        let values = decode_line(path, i + 2, line)?;
        if values.len() != layout.width() {
            bail!(
                ErrorKind::InvalidData,
                "Shard row width differs from its header",
                format!(
                    "{}:{} has {} cells, header has {}",
                    path.display(),
                    i + 2,
                    values.len(),
                    layout.width()
                )
            );
        }
        records.push(RawRecord::new(values));
    }

    debug!(table, path = %path.display(), records = records.len(), "shard read");

    Ok(Shard {
        path: path.to_path_buf(),
        layout,
        records,
    })
}

fn decode_line(path: &Path, line_number: usize, line: &str) -> DeidResult<Vec<Option<String>>> {
    decode_row(line).map_err(|err| {
        deid_error!(
            ErrorKind::InvalidData,
            "Shard holds a malformed cell",
            format!("{}:{line_number}", path.display()),
            source: err
        )
    })
}

/// Writes `records` under a header for `layout`.
///
/// The file is written next to `path` first and renamed into place, so readers never see a
/// partial shard.
pub async fn write_shard(path: &Path, layout: &TableLayout, records: &[RawRecord]) -> DeidResult<()> {
    let mut contents = encode_row(layout.columns.iter().map(|column| Some(column.as_str())));
    contents.push('\n');
    for record in records {
        contents.push_str(&encode_row(record.values.iter().map(Option::as_deref)));
        contents.push('\n');
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let staging = path.with_extension(format!("{SHARD_EXTENSION}.tmp"));
    tokio::fs::write(&staging, contents).await?;
    tokio::fs::rename(&staging, path).await?;

    debug!(path = %path.display(), records = records.len(), "shard written");

    Ok(())
}
