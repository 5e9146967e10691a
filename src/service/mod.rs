//! Service facades the request handlers call.
//!
//! Each facade resolves the backend and model, fills in the model path, and
//! delegates. Errors are logged once here; handlers only translate them to
//! status codes.

mod llm;
mod stt;
mod tts;

pub use llm::Llm;
pub use stt::Stt;
pub use tts::Tts;

use crate::backend::Request;
use crate::error::{Error, Result};
use crate::model::{self, ModelStatus};

/// Fill `model_path` from the registry, failing when the model is unknown
/// or its artifacts could not be fetched.
fn resolve_model(models: &model::Manager, model_id: &str, req: Request) -> Result<Request> {
    let instance = models
        .registry()
        .get(model_id)
        .ok_or_else(|| Error::ModelNotFound(model_id.to_string()))?;

    if instance.status == ModelStatus::Failed {
        return Err(Error::Execution(format!(
            "model {model_id} is unavailable: {}",
            instance.error.as_deref().unwrap_or("artifact fetch failed")
        )));
    }

    Ok(Request {
        model_path: instance.path.display().to_string(),
        input: req.input,
        parameters: req.parameters,
    })
}
