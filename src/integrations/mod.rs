//! External service integrations.

pub mod scoring_client {
    pub use crate::scoring_client::*;
}

pub mod gemini_models {
    pub use crate::gemini_models::*;
}

pub mod cache_store {
    pub use crate::cache_store::*;
}

pub mod persistence {
    pub use crate::persistence::*;
}
