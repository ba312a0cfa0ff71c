#![forbid(unsafe_code)]
use {
    clap::Parser,
    log::info,
    rsow::{
        bus::sim::{simulated, SimBus},
        client::Client,
        owfs::{OwFs, Settings, Timeouts},
        srv::srv_async,
        *,
    },
    std::{path::PathBuf, time::Duration},
};

fn parse_scale(s: &str) -> std::result::Result<TemperatureScale, String> {
    TemperatureScale::parse(s).ok_or_else(|| format!("unknown temperature scale '{}' (C, F, K or R)", s))
}

fn parse_format(s: &str) -> std::result::Result<DeviceFormat, String> {
    DeviceFormat::parse(s).ok_or_else(|| format!("unknown device format '{}' (fdi, fi, fdidc, fdic, fidc, fic)", s))
}

#[derive(Debug, clap::Parser)]
#[command(version, about)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix; a bare port or host:port means tcp
    #[arg(default_value = "tcp!0.0.0.0!4304")]
    address: String,

    /// Listen address, overrides the positional one
    #[arg(short = 'p', long)]
    listen: Option<String>,

    /// Simulated device <family.id> on the simulated bus (repeatable)
    #[arg(long, value_name = "FAMILY.ID")]
    simulate: Vec<String>,

    /// Remote owserver to use as a bus (repeatable)
    #[arg(short, long, value_name = "HOST:PORT")]
    server: Vec<String>,

    /// Serial adapter device
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// USB adapter
    #[arg(short, long)]
    usb: bool,

    /// Cache lifetime of volatile values, in seconds
    #[arg(long, default_value_t = 15)]
    timeout_volatile: u64,

    /// Cache lifetime of stable values, in seconds
    #[arg(long, default_value_t = 300)]
    timeout_stable: u64,

    /// Cache lifetime of bus listings, in seconds
    #[arg(long, default_value_t = 60)]
    timeout_directory: u64,

    /// Cache lifetime of device locations, in seconds
    #[arg(long, default_value_t = 120)]
    timeout_presence: u64,

    /// Extra attempts for a failed bus operation
    #[arg(long, default_value_t = 3)]
    retries: usize,

    /// Temperature scale for clients that do not choose one
    #[arg(long, default_value = "C", value_parser = parse_scale)]
    temperature_scale: TemperatureScale,

    /// Serial number format for clients that do not choose one
    #[arg(long, default_value = "fdi", value_parser = parse_format)]
    format: DeviceFormat,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            timeouts: Timeouts {
                volatile: Duration::from_secs(self.timeout_volatile),
                stable: Duration::from_secs(self.timeout_stable),
                directory: Duration::from_secs(self.timeout_directory),
                presence: Duration::from_secs(self.timeout_presence),
            },
            retries: self.retries,
            sg: SemiGlobal::empty()
                .with_temperature_scale(self.temperature_scale)
                .with_device_format(self.format),
        }
    }
}

async fn owserver_main(cli: Cli) -> rsow::Result<i32> {
    if cli.usb || cli.device.is_some() {
        eprintln!("Error: no physical adapter driver is built in; use --simulate or --server");
        return Ok(1);
    }

    let mut builder = OwFs::builder(cli.settings());
    if !cli.simulate.is_empty() {
        let mut bus = SimBus::new();
        for name in &cli.simulate {
            let sn: SerialNumber = name.parse()?;
            info!("Simulating {}", sn);
            bus.attach(simulated(sn));
        }
        builder = builder.local(Box::new(bus));
    }
    for addr in &cli.server {
        builder = builder.remote(Client::new(addr)?);
    }
    if builder.is_empty() {
        eprintln!("Error: no bus given; use --simulate or --server");
        return Ok(1);
    }

    let fs = builder.build();
    let address = cli.listen.unwrap_or(cli.address);
    info!("Serving {} bus(es) on {}", fs.legs(), address);

    let served = tokio::select! {
        res = srv_async(fs, &address) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };
    info!("Statistics: {:?}", rsow::stats::snapshot());
    served.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = owserver_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_become_settings() {
        let cli = Cli::parse_from([
            "owserver",
            "--simulate",
            "10.A1B2C3D4E5F6",
            "--temperature-scale",
            "F",
            "--format",
            "fic",
            "--timeout-volatile",
            "2",
        ]);
        assert_eq!(cli.address, "tcp!0.0.0.0!4304");
        let settings = cli.settings();
        assert_eq!(settings.timeouts.volatile, Duration::from_secs(2));
        assert_eq!(settings.sg.temperature_scale(), TemperatureScale::Fahrenheit);
        assert_eq!(settings.sg.device_format(), DeviceFormat::Fic);
    }

    #[test]
    fn bad_scale_is_refused() {
        assert!(Cli::try_parse_from(["owserver", "--temperature-scale", "X"]).is_err());
    }

    #[tokio::test]
    async fn no_bus_exits_with_one() {
        let cli = Cli::parse_from(["owserver"]);
        assert_eq!(owserver_main(cli).await.unwrap(), 1);
        let cli = Cli::parse_from(["owserver", "--usb", "--simulate", "10.A1B2C3D4E5F6"]);
        assert_eq!(owserver_main(cli).await.unwrap(), 1);
    }
}
