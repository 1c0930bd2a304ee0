/// Failures of the engine's own setup paths. Request handling never
/// surfaces an error: every failure becomes a reply.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("catalog fixture error: {0}")]
    Fixture(String),
}
