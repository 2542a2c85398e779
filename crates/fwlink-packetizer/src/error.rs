use fwlink_stream::StreamError;

/// Errors raised while packetizing or reassembling frames.
#[derive(Debug, thiserror::Error)]
pub enum PacketizerError {
    /// The packet CRC does not match its contents.
    #[error("packet CRC mismatch on channel {channel} (stored {stored:#010x}, computed {computed:#010x})")]
    CrcMismatch {
        channel: u8,
        stored: u32,
        computed: u32,
    },

    /// The packet is shorter than its header.
    #[error("truncated packet ({size} bytes)")]
    Truncated { size: usize },

    /// The packet was produced by an incompatible packetizer.
    #[error("unsupported packet version {0}")]
    UnsupportedVersion(u8),

    /// No application is attached to the addressed channel.
    #[error("no application on channel {0}")]
    UnknownChannel(u8),

    /// Another live application already owns the channel.
    #[error("channel {0} already has an application")]
    ChannelInUse(u8),

    /// Frame storage or the lower stage failed.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

pub type Result<T> = std::result::Result<T, PacketizerError>;
