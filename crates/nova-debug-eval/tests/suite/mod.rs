// Part of the consolidated `nova-debug-eval` integration test harness (`tests/tests.rs`).
mod batch_rendering;
mod connection;
mod episode_lifecycle;
mod example_scenario;
