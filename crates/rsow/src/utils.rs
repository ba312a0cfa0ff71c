use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split an address of the form `proto!addr!port` into its protocol and
/// listen/connect address.
///
/// `tcp!0.0.0.0!4304` gives `("tcp", "0.0.0.0:4304")`, `unix!/tmp/ow!0`
/// gives `("unix", "/tmp/ow")`. Bare `host:port` and `port` are taken as tcp.
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.split('!');
    let first = split.next()?;

    match (split.next(), split.next()) {
        (Some(addr), Some(port)) => match first {
            "tcp" => Some((first, format!("{}:{}", addr, port))),
            "unix" => Some((first, addr.to_owned())),
            _ => Some((first, addr.to_owned())),
        },
        (None, None) if first.parse::<u16>().is_ok() => Some(("tcp", format!("0.0.0.0:{}", first))),
        (None, None) if first.contains(':') => Some(("tcp", first.to_owned())),
        _ => None,
    }
}
