// Wire protocols shared between the daemon and its clients.

pub mod events;
