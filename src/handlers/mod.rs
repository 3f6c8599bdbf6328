//! HTTP and WebSocket surface.
//!
//! Every manager is exposed through axum routes; identity comes from the
//! [`Identity`] extractor and the core never validates credentials itself.

mod connections;
mod conversations;
mod identity;
mod messages;

pub use connections::{
    health_check, poll, send_envelope, stream_connect, subscribe, unsubscribe, ws_connect,
};
pub use conversations::{
    add_participant, create_conversation, get_conversation, list_conversations,
    mark_conversation_read, remove_participant,
};
pub use identity::Identity;
pub use messages::{get_presence, list_messages, mark_messages_read, send_message, send_typing};
