use super::{Context, State, StateHandler};
use crate::pool::filter::{self, Filter};
use log::warn;
use serde_json::Value;

/// Administratively stopped. Receives nothing and arms no timers; only the
/// manager moves a host out of it.
#[derive(Debug)]
pub struct IdleState;

impl StateHandler for IdleState {
    fn filter(&self, _ctx: &dyn Context) -> Filter {
        filter::nothing()
    }

    fn process_forward(
        &mut self,
        ctx: &mut dyn Context,
        _payload: Value,
        num_hops: u32,
    ) -> Option<State> {
        warn!("{} dropping event forwarded after {num_hops} hops while idle", ctx.host());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::host::host;
    use crate::pool::message::{Channel, Message, MessageBody};
    use crate::pool::state::go_idle;
    use crate::pool::testing::{TestContext, assignments_for};
    use serde_json::json;

    #[test]
    fn test_idle_discards_everything() {
        let mut ctx = TestContext::new("h1");
        let mut state = go_idle(&mut ctx);
        state.start(&mut ctx);

        let bodies = [
            MessageBody::Heartbeat { timestamp_ms: 1 },
            MessageBody::Identification { assignments: None },
            MessageBody::Leader {
                assignments: Some(assignments_for("h0", &["h0", "h1"], 4)),
            },
            MessageBody::Offline,
            MessageBody::Query,
            MessageBody::Forward {
                payload: json!({}),
                num_hops: 0,
            },
        ];

        for body in bodies {
            let source = if matches!(body, MessageBody::Leader { .. }) { "h0" } else { "h2" };
            let message = Message {
                source: host(source),
                channel: Channel::Host(host("h1")),
                body,
            };
            assert!(state.process(&mut ctx, message).is_none());
        }

        assert!(ctx.timers.is_empty());
        assert!(ctx.published.is_empty());
        assert!(ctx.forwards.is_empty());
        assert!(!state.filter(&ctx).matches(&json!({"channel": "_admin"})));
        assert!(!state.filter(&ctx).matches(&json!({"channel": "h1"})));
    }
}
