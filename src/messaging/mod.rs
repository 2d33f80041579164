// Messaging - actions et queues entre le thread de contrôle et le callback

pub mod action;
pub mod channels;
pub mod notification;
