//! Onboarding stage: every freshly accepted connection lands here and stays
//! until it proposes an acceptable display name.

use crate::stage::{Action, Departure, Handle, Handler, StageBehavior, StageTable};
use crate::validity::SubState;
use log::info;
use protocol::{validate_username, ClientMessage, MessageKind, ServerMessage, UsernameResult};

/// Stage behavior for not-yet-named connections. Carries no per-connection
/// payload; the hooks keep their default no-op bodies.
pub struct Onboarding;

impl StageBehavior for Onboarding {
    type Data = ();

    fn name(&self) -> &'static str {
        "onboarding"
    }

    fn handler(&self, kind: MessageKind) -> Option<Handler<Self>> {
        match kind {
            MessageKind::ChangeUsername => Some(Self::handle_change_username),
            _ => None,
        }
    }

    fn sub_state(&self, _handle: Handle, _data: &()) -> SubState {
        SubState::Onboarding
    }
}

impl Onboarding {
    /// Validates the proposed name and always answers with a typed result.
    /// Success moves the connection to the lobby; failure leaves it here for
    /// another attempt.
    fn handle_change_username(
        &mut self,
        table: &mut StageTable<()>,
        handle: Handle,
        msg: ClientMessage,
    ) -> Action {
        let ClientMessage::ChangeUsername { username } = msg else {
            return Action::Continue;
        };

        let result = validate_username(&username);
        table.send(handle, &ServerMessage::UsernameResponse { result });

        if result == UsernameResult::Okay {
            info!("onboarding: '{}' accepted, moving to lobby", username);
            Action::Leave(Departure::Lobby { username })
        } else {
            Action::Continue
        }
    }
}
