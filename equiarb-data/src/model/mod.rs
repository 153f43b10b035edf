pub mod order_update;
pub mod tick;
