//! Plain-text rendering of store records

use chrono::{DateTime, SecondsFormat, Utc};
use speech_tasks_storage::{SegmentRecord, StepRecord, TaskRecord};

const PREVIEW_CHARS: usize = 60;

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn preview(text: &str) -> String {
    let single_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= PREVIEW_CHARS {
        return single_line;
    }
    let cut: String = single_line.chars().take(PREVIEW_CHARS).collect();
    format!("{cut}...")
}

pub fn task_row(task: &TaskRecord) -> String {
    format!(
        "{:<36}  {:<12}  {:<28}  {:>5}/{:<5}  {}",
        task.id,
        task.family,
        task.stage,
        task.segments_processed,
        task.segments_total,
        timestamp(&task.modified_at)
    )
}

pub fn task_header() -> String {
    format!(
        "{:<36}  {:<12}  {:<28}  {:>11}  {}",
        "ID", "FAMILY", "STAGE", "SEGMENTS", "MODIFIED"
    )
}

pub fn task_details(task: &TaskRecord) -> String {
    let mut lines = vec![
        format!("Task:       {}", task.id),
        format!("Family:     {}", task.family),
        format!("Key:        {}", task.logical_key),
        format!("Stage:      {}", task.stage),
        format!("Done:       {}", task.done),
        format!(
            "Segments:   {}/{}",
            task.segments_processed, task.segments_total
        ),
        format!("Created:    {} by {}", timestamp(&task.created_at), task.created_by),
        format!("Modified:   {}", timestamp(&task.modified_at)),
    ];
    if let Some(error) = &task.error {
        lines.push(format!("Error:      {error}"));
    }
    if let Some(result) = &task.result {
        lines.push(format!("Result:     {}", preview(result)));
    }
    lines.join("\n")
}

pub fn step_row(step: &StepRecord) -> String {
    let finished = step
        .finished_at
        .as_ref()
        .map_or_else(|| "-".to_string(), timestamp);
    let mut row = format!(
        "{:<28}  {:<11}  {}  {}",
        step.stage,
        step.status.as_str(),
        timestamp(&step.started_at),
        finished
    );
    if let Some(error) = &step.error {
        row.push_str("  ");
        row.push_str(error);
    }
    row
}

pub fn segment_row(segment: &SegmentRecord) -> String {
    let state = if segment.is_processed {
        "processed"
    } else if segment.is_processing {
        "claimed"
    } else {
        "pending"
    };
    format!("{:>5}  {:<9}  {}", segment.order, state, preview(segment.output()))
}
