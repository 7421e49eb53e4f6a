pub mod collaborators;
pub mod copy_engine;
pub mod order_executor;
pub mod position_sizer;
