use crate::settings::*;

// Bundled session-wide state, threaded through the pipeline by Arc, the same way Arc<Context>
// is threaded through Debugger::new() and friends in the teacher.
pub struct Context {
    pub settings: Settings,
}

impl Context {
    pub fn new(settings: Settings) -> Self {
        Context {settings}
    }

    pub fn invalid() -> Self {
        Context {settings: Settings::default()}
    }
}
