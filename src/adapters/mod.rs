pub mod binance;
pub mod binance_user_ws;
pub mod binance_ws;
pub mod paper;
