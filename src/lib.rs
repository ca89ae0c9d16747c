pub mod commands;
pub mod connection;
pub mod instruments;
pub mod modbus;
pub mod output;
pub mod poll;
pub mod reader;
pub mod registers;
pub mod sentinel;

#[cfg(test)]
mod testing;
