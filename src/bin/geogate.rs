use geogate::{
    addr::ClientAddr,
    config::GeoConfig,
    database::mmdb::{CityReader, CountryReader},
    GeoApp, Matcher, Result,
};
use std::path::PathBuf;
use structopt::StructOpt;
use tracing::info;

#[derive(Debug, StructOpt)]
struct Common {
    /// RON configuration file.
    #[structopt(long, short, parse(from_os_str))]
    config: PathBuf,
}

#[derive(Debug, StructOpt)]
#[structopt(name = "geogate", about = "Match client addresses against geo databases")]
enum Opt {
    /// Prints whether each address matches the configured matchers.
    Lookup {
        #[structopt(flatten)]
        common: Common,

        /// Value of the X-Forwarded-For header to evaluate with every address.
        #[structopt(long)]
        forwarded_for: Option<String>,

        /// Value of the X-Real-IP header to evaluate with every address.
        #[structopt(long)]
        real_ip: Option<String>,

        /// Client addresses, optionally with a port.
        #[structopt(required = true)]
        addrs: Vec<String>,
    },
    /// Downloads a fresh copy of every remote database.
    Update {
        #[structopt(flatten)]
        common: Common,
    },
}

async fn matchers(
    app: &GeoApp,
    config: &GeoConfig,
) -> Result<Vec<(&'static str, Box<dyn Matcher>)>> {
    let mut matchers: Vec<(&'static str, Box<dyn Matcher>)> = Vec::new();

    if let Some(country) = &config.country {
        let matcher = app.country_matcher::<CountryReader>(country).await?;
        matchers.push(("country", Box::new(matcher) as Box<dyn Matcher>));
    }
    if let Some(region) = &config.region {
        let matcher = app.region_matcher::<CityReader>(region).await?;
        matchers.push(("region", Box::new(matcher) as Box<dyn Matcher>));
    }

    Ok(matchers)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _logger = flexi_logger::Logger::try_with_env_or_str("warn,geogate=info")?.start()?;

    let opt = Opt::from_args();
    let common = match &opt {
        Opt::Lookup { common, .. } | Opt::Update { common } => common,
    };

    let config = GeoConfig::load(&common.config)?;
    let app = GeoApp::from_config(&config);
    let matchers = matchers(&app, &config).await?;

    match opt {
        Opt::Lookup {
            forwarded_for,
            real_ip,
            addrs,
            ..
        } => {
            for addr in addrs {
                let mut client = ClientAddr::new(addr.as_str());
                if let Some(value) = &forwarded_for {
                    client = client.with_forwarded_for(value.as_str());
                }
                if let Some(value) = &real_ip {
                    client = client.with_real_ip(value.as_str());
                }

                for (name, matcher) in &matchers {
                    let outcome = matcher.matches(&client).await;
                    println!(
                        "{}\t{}\t{}\t{}\t{}",
                        addr,
                        name,
                        if outcome.matched { "match" } else { "no-match" },
                        outcome
                            .client_ip
                            .map(|ip| ip.to_string())
                            .unwrap_or_else(|| "-".to_owned()),
                        outcome.location.as_deref().unwrap_or("-"),
                    );
                }
            }
        }
        Opt::Update { .. } => {
            let updated = app.update_all().await?;
            info!(updated, "Remote databases updated");
        }
    }

    drop(matchers);
    app.shutdown().await;
    Ok(())
}
