pub mod channel_data;
pub mod config;
pub mod error;
pub mod ext;
pub mod member;
pub mod options;
pub mod unique_id;

#[cfg(test)]
mod test {
    use tracing::Level;

    use crate::ext::init_logger;

    #[ctor::ctor]
    fn init() {
        init_logger(Level::DEBUG)
    }
}
