// Pipeline modules and shared errors/models
pub mod batch {
    pub use crate::batch::*;
}

pub mod concurrency {
    pub use crate::concurrency::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
