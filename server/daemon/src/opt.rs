#[derive(Debug, Args)]
struct CommonOpt {
    /// Path to the server's configuration file.
    #[clap(short, long = "config", env = "GATEHOUSE_CONFIG")]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum GatehousedOpt {
    #[clap(name = "server")]
    /// Start the Gatehouse Server
    Server(CommonOpt),
    #[clap(name = "configtest")]
    /// Test the server configuration and flow definitions, without starting network listeners.
    ConfigTest(CommonOpt),
    /// Print the program version and exit
    #[clap(name = "version")]
    Version(CommonOpt),
}

impl GatehousedOpt {
    fn commonopt(&self) -> &CommonOpt {
        match self {
            GatehousedOpt::Server(sopt)
            | GatehousedOpt::ConfigTest(sopt)
            | GatehousedOpt::Version(sopt) => sopt,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "gatehoused")]
struct GatehousedParser {
    #[command(subcommand)]
    commands: GatehousedOpt,
}
