pub mod channel;
pub mod codec;
pub mod config;
pub mod parallel;
pub mod pool;
pub mod receiver;
pub mod sender;
pub mod socket;
pub mod state;
pub mod worker;

pub const TRANSPORT_CONFIG: &'static str = include_str!("../transport.toml");

#[cfg(test)]
mod test {
    use tracing::Level;

    use tribes_core::ext::init_logger;

    #[ctor::ctor]
    fn init() {
        init_logger(Level::DEBUG)
    }
}
