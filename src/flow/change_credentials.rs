//! Credential change flows: PIN, PUK and pairing secret share one shape,
//! differing only in the prompt and the command they issue.

use tracing::warn;

use super::context::{FlowAbort, FlowContext, FlowOutput};
use super::params::{errors, keys, signals};

/// Which credential a change flow replaces.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Credential {
    Pin,
    Puk,
    PairingSecret,
}

impl Credential {
    const fn param_key(self) -> &'static str {
        match self {
            Self::Pin => keys::NEW_PIN,
            Self::Puk => keys::NEW_PUK,
            Self::PairingSecret => keys::NEW_PAIRING,
        }
    }

    const fn prompt(self) -> &'static str {
        match self {
            Self::Pin => signals::ENTER_NEW_PIN,
            Self::Puk => signals::ENTER_NEW_PUK,
            Self::PairingSecret => signals::ENTER_NEW_PAIRING,
        }
    }
}

pub(crate) fn execute(ctx: &FlowContext, credential: Credential) -> FlowOutput {
    ctx.wait_for_card()?;
    ctx.select_keycard()?;
    ctx.authenticate(true)?;

    let key = credential.param_key();
    let mut new_value = ctx.param_str(key);
    if new_value.is_none() {
        ctx.pause_and_wait(credential.prompt(), errors::MISSING_CREDENTIALS)?;
        new_value = ctx.param_str(key);
    }
    let Some(new_value) = new_value else {
        return Err(FlowAbort::Fail(errors::MISSING_CREDENTIALS));
    };

    let change = {
        let mut cs = ctx.command_set.lock().unwrap();
        match credential {
            Credential::Pin => cs.change_pin(&new_value),
            Credential::Puk => cs.change_puk(&new_value),
            Credential::PairingSecret => cs.change_pairing_secret(&new_value),
        }
    };
    if let Err(e) = change {
        warn!(?credential, error = %e, "credential change failed");
        return Err(FlowAbort::Fail(errors::CHANGE_FAILED));
    }

    // The session PIN may have just changed; keep params coherent for a
    // flow restart.
    if matches!(credential, Credential::Pin) {
        ctx.set_param(keys::PIN, serde_json::json!(new_value));
    }

    Ok(ctx.card_map())
}
