// 領域層：核心模型與介面，不做 I/O

pub mod model;
pub mod ports;
