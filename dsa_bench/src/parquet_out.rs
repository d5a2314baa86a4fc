use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray, UInt32Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::config::BenchConfig;
use crate::error::Result;
use crate::worker::WorkerReport;

/// One row per worker.
pub struct BenchRow {
    pub worker: u32,
    /// -1 when the worker was not pinned.
    pub core: i64,
    pub queue: String,
    pub mode: String,
    pub workload: String,
    pub state: String,
    pub block_size: u64,
    pub desc_count: u32,
    pub start_ns: u64,
    pub end_ns: u64,
    pub completed: u64,
    pub failed: u64,
    pub busy: u64,
    pub fatal: u64,
    pub rounds: u64,
    pub miops: f64,
}

pub fn rows_from_reports(config: &BenchConfig, reports: &[WorkerReport]) -> Vec<BenchRow> {
    reports
        .iter()
        .map(|r| {
            let elapsed = r.end_ns.saturating_sub(r.start_ns);
            let miops = if elapsed == 0 {
                0.0
            } else {
                r.stats.completed as f64 * 1000.0 / elapsed as f64
            };
            BenchRow {
                worker: r.id as u32,
                core: r.core.map_or(-1, |c| c as i64),
                queue: r.queue.clone(),
                mode: config.mode.to_string(),
                workload: config.workload.as_str().to_string(),
                state: r.state.as_str().to_string(),
                block_size: config.block_size as u64,
                desc_count: config.desc_count as u32,
                start_ns: r.start_ns,
                end_ns: r.end_ns,
                completed: r.stats.completed,
                failed: r.stats.failed,
                busy: r.stats.busy,
                fatal: r.stats.fatal,
                rounds: r.stats.rounds,
                miops,
            }
        })
        .collect()
}

fn utf8<'a>(values: impl Iterator<Item = &'a str>) -> ArrayRef {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn counters(values: impl Iterator<Item = u64>) -> ArrayRef {
    Arc::new(UInt64Array::from(values.collect::<Vec<_>>()))
}

pub fn write_parquet(path: &Path, rows: &[BenchRow]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let schema = Arc::new(Schema::new(vec![
        Field::new("worker", DataType::UInt32, false),
        Field::new("core", DataType::Int64, false),
        Field::new("queue", DataType::Utf8, false),
        Field::new("mode", DataType::Utf8, false),
        Field::new("workload", DataType::Utf8, false),
        Field::new("state", DataType::Utf8, false),
        Field::new("block_size", DataType::UInt64, false),
        Field::new("desc_count", DataType::UInt32, false),
        Field::new("start_ns", DataType::UInt64, false),
        Field::new("end_ns", DataType::UInt64, false),
        Field::new("completed", DataType::UInt64, false),
        Field::new("failed", DataType::UInt64, false),
        Field::new("busy", DataType::UInt64, false),
        Field::new("fatal", DataType::UInt64, false),
        Field::new("rounds", DataType::UInt64, false),
        Field::new("miops", DataType::Float64, false),
    ]));

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(UInt32Array::from(
                rows.iter().map(|r| r.worker).collect::<Vec<_>>(),
            )) as ArrayRef,
            Arc::new(Int64Array::from(
                rows.iter().map(|r| r.core).collect::<Vec<_>>(),
            )) as ArrayRef,
            utf8(rows.iter().map(|r| r.queue.as_str())),
            utf8(rows.iter().map(|r| r.mode.as_str())),
            utf8(rows.iter().map(|r| r.workload.as_str())),
            utf8(rows.iter().map(|r| r.state.as_str())),
            counters(rows.iter().map(|r| r.block_size)),
            Arc::new(UInt32Array::from(
                rows.iter().map(|r| r.desc_count).collect::<Vec<_>>(),
            )) as ArrayRef,
            counters(rows.iter().map(|r| r.start_ns)),
            counters(rows.iter().map(|r| r.end_ns)),
            counters(rows.iter().map(|r| r.completed)),
            counters(rows.iter().map(|r| r.failed)),
            counters(rows.iter().map(|r| r.busy)),
            counters(rows.iter().map(|r| r.fatal)),
            counters(rows.iter().map(|r| r.rounds)),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.miops).collect::<Vec<_>>(),
            )) as ArrayRef,
        ],
    )?;

    let file = std::fs::File::create(path)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(())
}
