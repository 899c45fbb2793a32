//! Card information flow, optionally performing a factory reset.

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::context::{FlowAbort, FlowContext, FlowOutput};
use super::params::{errors, keys};

pub(crate) fn execute(ctx: &FlowContext) -> FlowOutput {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;

    if ctx.param_bool(keys::FACTORY_RESET) {
        debug!("factory reset requested");
        // Requires only SELECT, no authentication. The result is emitted
        // before the re-scanned card is detected again.
        let reset = ctx.command_set.lock().unwrap().factory_reset();
        if let Err(e) = reset {
            warn!(error = %e, "factory reset failed");
            return Err(FlowAbort::Fail(errors::FACTORY_RESET_FAILED));
        }
        ctx.channel.force_scan();

        let mut result = Map::new();
        result.insert(keys::ERROR.into(), json!(errors::OK));
        result.insert("factory-reset".into(), json!(true));
        return Ok(result);
    }

    let card = ctx.card();
    let mut app_info = Map::new();
    app_info.insert(keys::INSTANCE_UID.into(), json!(card.instance_uid));
    app_info.insert(keys::KEY_UID.into(), json!(card.key_uid));
    app_info.insert(keys::INITIALIZED.into(), json!(card.initialized));
    app_info.insert(
        keys::KEY_INITIALIZED.into(),
        json!(!card.key_uid.is_empty()),
    );
    app_info.insert(keys::FREE_SLOTS.into(), json!(card.free_slots));
    if let Some(version) = card.version {
        app_info.insert(keys::VERSION.into(), json!(version.to_string()));
    }

    let mut result = Map::new();
    result.insert(keys::ERROR.into(), json!(errors::OK));
    result.insert(keys::APP_INFO.into(), Value::Object(app_info));

    // Authentication here only determines whether the card counts as
    // paired; its failure is not the flow's failure.
    match ctx.authenticate(true) {
        Ok(()) => {
            result.insert(keys::PAIRED.into(), json!(true));
            let status = ctx.command_set.lock().unwrap().get_status();
            if let Ok(status) = status {
                ctx.update_card_retries(
                    status.pin_retry_count as i32,
                    status.puk_retry_count as i32,
                );
                result.insert(keys::PIN_RETRIES.into(), json!(status.pin_retry_count));
                result.insert(keys::PUK_RETRIES.into(), json!(status.puk_retry_count));
            }
        }
        Err(FlowAbort::Cancelled) => return Err(FlowAbort::Cancelled),
        Err(FlowAbort::Fail(_)) => {
            debug!("authentication failed; reporting card as unpaired");
            result.insert(keys::PAIRED.into(), json!(false));
        }
    }

    Ok(result)
}
