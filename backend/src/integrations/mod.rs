pub mod shop;

pub use shop::{ExternalOrder, IntegrationError, OrderSource, ShopClient};
