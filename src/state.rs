use tokio::sync::watch;

use crate::events::EventSender;
use crate::game::controller::GameSnapshot;
use crate::game::GameHandle;

/// Context shared by API routes and the WebSocket bridge.
#[derive(Clone)]
pub struct ServiceContext {
    pub game: GameHandle,
    pub event_tx: EventSender,
    pub snapshot_rx: watch::Receiver<GameSnapshot>,
}
