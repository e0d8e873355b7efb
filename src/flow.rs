//! Request-scoped context supplied by the external dispatch layer.
//!
//! Every operation receives a [`Flow`]: a fixed clock reading taken when
//! the request arrived, the caller's network origin, and the caller's
//! authenticated session when one was presented. Operations never read
//! the wall clock themselves, so a whole flow observes one instant.

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use uuid::Uuid;

use crate::error::Error;

/// The authenticated session attached to an inbound request.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub session_id: Uuid,
    pub account_id: Uuid,
}

/// Per-request context.
#[derive(Debug, Clone)]
pub struct Flow {
    now: DateTime<Utc>,
    client_ip: IpNetwork,
    caller: Option<Caller>,
}

impl Flow {
    #[must_use]
    pub fn new(now: DateTime<Utc>, client_ip: IpNetwork) -> Self {
        Self {
            now,
            client_ip,
            caller: None,
        }
    }

    #[must_use]
    pub fn with_caller(mut self, caller: Caller) -> Self {
        self.caller = Some(caller);
        self
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    #[must_use]
    pub fn client_ip(&self) -> IpNetwork {
        self.client_ip
    }

    #[must_use]
    pub fn caller(&self) -> Option<Caller> {
        self.caller
    }

    pub(crate) fn require_caller(&self) -> Result<Caller, Error> {
        self.caller.ok_or(Error::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::{Caller, Flow};
    use crate::error::Error;
    use chrono::Utc;
    use uuid::Uuid;

    fn flow() -> Flow {
        Flow::new(Utc::now(), "203.0.113.9/32".parse().unwrap())
    }

    #[test]
    fn anonymous_flow_has_no_caller() {
        assert!(flow().caller().is_none());
        assert!(matches!(
            flow().require_caller(),
            Err(Error::Unauthorized)
        ));
    }

    #[test]
    fn with_caller_attaches_session() {
        let caller = Caller {
            session_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
        };
        let flow = flow().with_caller(caller);
        assert_eq!(flow.caller().unwrap().account_id, caller.account_id);
        assert_eq!(
            flow.require_caller().unwrap().session_id,
            caller.session_id
        );
    }
}
