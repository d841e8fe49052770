/*!
# Diskbeat DevKit - test doubles for probes and collectors

- [`MockCollector`]: TCP endpoint recording every event a probe sends
- [`FakeProbe`]: scripted client writing events or raw bytes to a collector
- [`EventBuilder`]: sample / resource / heartbeat fixtures
- [`init_test_logging`]: log output routed through the test harness
*/

pub mod event_builder;
pub mod fake_probe;
pub mod mock_collector;
pub mod test_utils;

pub use event_builder::EventBuilder;
pub use fake_probe::FakeProbe;
pub use mock_collector::{ConnectionLog, MockCollector};
pub use test_utils::{init_test_logging, wait_until};
