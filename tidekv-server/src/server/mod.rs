pub mod handlers;
pub mod node;
pub mod router;

pub use handlers::AppState;
pub use node::Node;
pub use router::create_router;
