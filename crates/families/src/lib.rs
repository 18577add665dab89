//! Task families of the speech pipeline
//!
//! Each family pairs a stage enum with a payload type and executors built on the
//! collaborator traits in [`collaborators`]:
//!
//! | family | stages |
//! |---|---|
//! | `audio` | convert, upload, start recognition, retrieve result, segment, punctuate |
//! | `caption` | fetch metadata, download captions, segment, punctuate with context |
//! | `openai` | convert, transcribe, segment, punctuate with context, format markdown |
//! | `youtube` | download streams, merge |
//! | `subscription` | segment document, punctuate with context |

pub mod audio;
pub mod caption;
pub mod collaborators;
pub mod openai;
pub mod punctuation;
pub mod segmenter;
pub mod steps;
pub mod subscription;
pub mod youtube;

pub use audio::{AudioFamily, AudioPayload, AudioServices, AudioStage};
pub use caption::{CaptionFamily, CaptionPayload, CaptionStage};
pub use openai::{TranscriptionFamily, TranscriptionPayload, TranscriptionServices, TranscriptionStage};
pub use segmenter::{Phrase, Segmenter};
pub use subscription::{SubscriptionFamily, SubscriptionPayload, SubscriptionStage};
pub use youtube::{DownloadFamily, DownloadPayload, DownloadStage};

use speech_tasks_engine::{prepare_continuation, EngineError, EngineResult, PipelineStage};
use speech_tasks_storage::{TaskRecord, TaskStore};

/// Persisted names of every family
pub const FAMILY_NAMES: &[&str] = &["audio", "caption", "openai", "youtube", "subscription"];

/// Make a failed task runnable again from outside its scheduler
///
/// The stage enum is picked from the family stored on the task. Claims of an
/// unfinished task are left alone since a scheduler in another process may own
/// them; `reset-claims` releases those explicitly. Returns the task as stored
/// afterwards, or `None` for an unknown id.
pub async fn continue_task(store: &dyn TaskStore, task_id: &str) -> EngineResult<Option<TaskRecord>> {
    let Some(record) = store.get_task(task_id).await? else {
        return Ok(None);
    };
    match record.family.as_str() {
        "audio" => continued::<AudioStage>(store, task_id).await?,
        "caption" => continued::<CaptionStage>(store, task_id).await?,
        "openai" => continued::<TranscriptionStage>(store, task_id).await?,
        "youtube" => continued::<DownloadStage>(store, task_id).await?,
        "subscription" => continued::<SubscriptionStage>(store, task_id).await?,
        other => return Err(EngineError::UnknownFamily(other.to_string())),
    }
    Ok(store.get_task(task_id).await?)
}

async fn continued<S: PipelineStage>(store: &dyn TaskStore, task_id: &str) -> EngineResult<()> {
    prepare_continuation::<S>(store, task_id, false).await?;
    Ok(())
}
