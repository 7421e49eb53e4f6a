pub mod binance;
pub mod bingx;
pub mod bus;
pub mod bybit;
pub mod fill_tracker;
pub mod listener;
pub mod okx;
pub mod seen_orders;

pub use bus::{EventBus, EventConsumer, EventPublisher};
pub use listener::{run_stream_listener, ListenerContext, ListenerError, StreamVenue};
pub use okx::{run_okx_poller, OkxPoller};
