//! Login flow: export the whisper and encryption private keys.

use serde_json::Value;

use super::context::{FlowContext, FlowOutput};
use super::export::export_key_json;
use super::params::keys;
use crate::command_set::ExportOption;
use crate::constants::paths;

pub(crate) fn execute(ctx: &FlowContext) -> FlowOutput {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;
    ctx.require_keys()?;
    ctx.authenticate(true)?;

    // First export seeds the card's current-key pointer.
    let whisper = export_key_json(ctx, paths::WHISPER, true, ExportOption::PrivateAndPublic)?;
    let encryption = export_key_json(ctx, paths::ENCRYPTION, false, ExportOption::PrivateAndPublic)?;

    let mut result = ctx.card_map();
    result.insert(keys::WHISPER_KEY.into(), Value::Object(whisper));
    result.insert(keys::ENCRYPTION_KEY.into(), Value::Object(encryption));
    Ok(result)
}
