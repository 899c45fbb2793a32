//! Export helper shared by the key-exporting flows.

use serde_json::{Map, Value};
use tracing::warn;

use super::context::{FlowAbort, FlowContext};
use super::params::errors;
use crate::command_set::ExportOption;

/// Export one key and return its JSON view, mapping failures onto the
/// stable `export-failed` tag.
pub(crate) fn export_key_json(
    ctx: &FlowContext,
    path: &str,
    make_current: bool,
    what: ExportOption,
) -> Result<Map<String, Value>, FlowAbort> {
    let parsed = path
        .parse()
        .map_err(|_| FlowAbort::Fail(errors::EXPORT_FAILED))?;
    let keypair = ctx
        .command_set
        .lock()
        .unwrap()
        .export_key(make_current, &parsed, what);
    match keypair {
        Ok(keypair) => match keypair.to_json() {
            Value::Object(map) => Ok(map),
            _ => unreachable!("keypair JSON view is always an object"),
        },
        Err(e) => {
            warn!(path, error = %e, "key export failed");
            Err(FlowAbort::Fail(errors::EXPORT_FAILED))
        }
    }
}
