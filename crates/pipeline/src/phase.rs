//! The SMTP protocol phases a pipeline is walked for.

/// One of the five phases stages can hook into. `Connect`-time `init` and
/// session-end `terminate` are not phases in this sense — every stage
/// always runs those.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Helo,
    Auth,
    Mail,
    Rcpt,
    Data,
}
