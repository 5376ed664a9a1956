//! relay-mq workspace root.
//!
//! The broker lives in `crates/mq-protocol` (wire codec), `crates/mq-engine`
//! (broker core), and `services/broker` (deployable binary with the TCP
//! transport and HTTP producer edge).  This root package exists to host the
//! end-to-end integration suites under `tests/integration/`.
