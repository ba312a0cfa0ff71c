#![forbid(unsafe_code)]
use {
    clap::{Parser, Subcommand},
    log::debug,
    rsow::{client::Client, *},
    std::io::Write,
};

#[derive(Debug, Subcommand)]
enum Command {
    /// Read a property
    Read {
        path: String,
        /// Largest number of bytes wanted
        #[arg(long, default_value_t = MAX_PAYLOAD as usize)]
        size: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Write a value to a property
    Write {
        path: String,
        value: String,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// List a directory
    Dir {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Formatted length of a property
    Size { path: String },
    /// Bus a device answers on
    Presence { path: String },
    /// Check the server is alive
    Nop,
}

#[derive(Debug, clap::Parser)]
#[command(version, about)]
struct Cli {
    /// owserver address: host:port, port, tcp!host!port or unix!path!0
    #[arg(short, long, default_value = "127.0.0.1:4304")]
    server: String,

    /// Temperature scale (C, F, K or R)
    #[arg(long)]
    temperature_scale: Option<String>,

    /// Serial number format (fdi, fi, fdidc, fdic, fidc, fic)
    #[arg(long)]
    format: Option<String>,

    /// Include bus.N entries in listings
    #[arg(long)]
    bus_ret: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn flags(&self) -> rsow::Result<SemiGlobal> {
        let mut sg = SemiGlobal::empty();
        if self.bus_ret {
            sg |= SemiGlobal::BUSRET;
        }
        if let Some(ref s) = self.temperature_scale {
            let scale = TemperatureScale::parse(s).ok_or(Error::No(errno::EINVAL))?;
            sg = sg.with_temperature_scale(scale);
        }
        if let Some(ref s) = self.format {
            let format = DeviceFormat::parse(s).ok_or(Error::No(errno::EINVAL))?;
            sg = sg.with_device_format(format);
        }
        Ok(sg)
    }
}

async fn owshell_main(cli: Cli) -> rsow::Result<i32> {
    let client = Client::new(&cli.server)?.with_flags(cli.flags()?);
    debug!("using {}", client);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match cli.command {
        Command::Read { path, size, offset } => {
            let data = client.read(&path, size, offset).await?;
            out.write_all(&data)?;
            writeln!(out)?;
        }
        Command::Write { path, value, offset } => {
            client.write(&path, value.as_bytes(), offset).await?;
        }
        Command::Dir { path } => {
            let mut entries = Vec::new();
            client.dir(&path, |entry| entries.push(entry)).await?;
            for entry in entries {
                writeln!(out, "{}", entry)?;
            }
        }
        Command::Size { path } => writeln!(out, "{}", client.size(&path).await?)?,
        Command::Presence { path } => writeln!(out, "{}", client.presence(&path).await?)?,
        Command::Nop => client.nop().await?,
    }
    Ok(0)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = owshell_main(Cli::parse()).await.unwrap_or_else(|e| {
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
    fn session_flags_from_options() {
        let cli = Cli::parse_from(["owshell", "--bus-ret", "--temperature-scale", "K", "dir"]);
        let sg = cli.flags().unwrap();
        assert!(sg.contains(SemiGlobal::BUSRET));
        assert_eq!(sg.temperature_scale(), TemperatureScale::Kelvin);

        let cli = Cli::parse_from(["owshell", "--format", "xyz", "nop"]);
        assert_eq!(cli.flags().unwrap_err().errno(), errno::EINVAL);
    }
}
