pub mod gossip;
pub mod voter;
