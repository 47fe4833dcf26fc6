pub mod alert;
pub mod contract;
pub mod etf;
