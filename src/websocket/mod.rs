//! WebSocket Relay
//!
//! Accepts client connections, authenticates them and fans frames out
//! between them.
//!
//! ## Architecture
//!
//! - **ConnectionActor**: owns one connection; a reader and a writer task
//! - **Outbox**: bounded per-connection queue drained by the writer
//! - **Hub**: registry of authenticated connections and their conversations
//! - **Handler**: admission check and WebSocket upgrade
//! - **Messages**: wire envelope and the relay's own replies
//!
//! ## Protocol
//!
//! Clients connect to `/ws` and must authenticate before anything else is
//! processed:
//!
//! ```javascript
//! const ws = new WebSocket('ws://localhost:3567/ws');
//!
//! ws.onopen = () => {
//!   ws.send(JSON.stringify({
//!     type: 'auth',
//!     payload: {username: 'ana', password: 'secret', action: 'login'},
//!   }));
//! };
//!
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data);
//!   if (msg.type === 'auth_success') console.log('Logged in as', msg.username);
//! };
//! ```

mod actor;
mod handler;
mod hub;
mod messages;
mod outbox;

pub use actor::ConnectionActor;
pub use handler::websocket_handler;
pub use hub::{Delivery, DeliveryMode, Hub, HubConfig};
pub use messages::{
    AuthAction, AuthPayload, ConversationId, Envelope, Frame, ServerMessage, UserId, AUTH,
    AUTH_ERROR, AUTH_SUCCESS,
};
pub use outbox::{ActorId, Outbox, OutboxReceiver, PushError, DEFAULT_QUEUE_CAPACITY};
