use std::net::{IpAddr, Ipv4Addr};

use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone, Default)]
#[structopt(name = "mqbroker", about = "In-memory MQTT v3.1/v3.1.1 broker")]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Address to bind, "0" is shorthand for 0.0.0.0
    #[structopt(name = "bind-addr", short = "b", long, parse(try_from_str = parse_bind_addr))]
    pub bind_addr: Option<IpAddr>,

    /// Port to listen on
    #[structopt(name = "bind-port", short = "p", long)]
    pub bind_port: Option<u16>,
}

fn parse_bind_addr(s: &str) -> Result<IpAddr, std::net::AddrParseError> {
    if s == "0" {
        Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    } else {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let opts = Options::from_iter(["mqbroker", "-b", "0", "--bind-port", "1884"]);
        assert_eq!(opts.bind_addr, Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        assert_eq!(opts.bind_port, Some(1884));
        assert!(opts.cfg_name.is_none());

        let opts = Options::from_iter(["mqbroker", "--bind-addr", "127.0.0.1", "-f", "mq.toml"]);
        assert_eq!(opts.bind_addr, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(opts.cfg_name.as_deref(), Some("mq.toml"));

        assert!(Options::from_iter_safe(["mqbroker", "-b", "nope"]).is_err());
    }
}
