//! Metadata flows: read and write the public-slot metadata blob.

use serde_json::{json, Value};
use tracing::warn;

use super::context::{FlowAbort, FlowContext, FlowOutput};
use super::params::{errors, keys, signals};
use crate::constants::SLOT_PUBLIC_DATA;
use crate::metadata::Metadata;

pub(crate) fn get_metadata(ctx: &FlowContext) -> FlowOutput {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;

    // The public slot needs no secure channel.
    let blob = match ctx.command_set.lock().unwrap().get_data(SLOT_PUBLIC_DATA) {
        Ok(blob) => blob,
        Err(e) => {
            warn!(error = %e, "metadata fetch failed");
            return Err(FlowAbort::Fail(errors::CARD_ERROR));
        }
    };
    let metadata = if blob.is_empty() {
        Metadata::default()
    } else {
        match Metadata::decode(&blob) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(error = %e, "malformed metadata blob");
                return Err(FlowAbort::Fail(errors::CARD_ERROR));
            }
        }
    };

    let mut result = ctx.card_map();
    result.insert(keys::ERROR.into(), json!(errors::OK));
    result.insert(keys::CARD_METADATA.into(), metadata.to_json());
    Ok(result)
}

pub(crate) fn store_metadata(ctx: &FlowContext) -> FlowOutput {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;
    ctx.authenticate(true)?;

    let mut name = ctx.param_str(keys::CARD_NAME);
    if name.is_none() {
        ctx.pause_and_wait(signals::ENTER_NAME, errors::MISSING_CREDENTIALS)?;
        name = ctx.param_str(keys::CARD_NAME);
    }
    let Some(name) = name else {
        return Err(FlowAbort::Fail(errors::MISSING_CREDENTIALS));
    };

    let wallet_paths: Vec<String> = match ctx.param(keys::PATHS) {
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

    let blob = Metadata::from_paths(&name, &wallet_paths)
        .and_then(|metadata| metadata.encode())
        .map_err(|e| {
            warn!(error = %e, "metadata encoding failed");
            FlowAbort::Fail(errors::CARD_ERROR)
        })?;

    if let Err(e) = ctx
        .command_set
        .lock()
        .unwrap()
        .store_data(SLOT_PUBLIC_DATA, &blob)
    {
        warn!(error = %e, "metadata store failed");
        return Err(FlowAbort::Fail(errors::CARD_ERROR));
    }

    let mut result = ctx.card_map();
    result.insert(keys::ERROR.into(), json!(errors::OK));
    Ok(result)
}
