use anyhow::{bail, Context};
use avahi_dbus::client::{self, EntryGroup, RecordBrowser, ServiceBrowser};
use avahi_dbus::config::{self, Config};
use avahi_dbus::types::{
    dns_class, dns_type, EntryGroupState, EntryGroupStateChange, Interface, LookupFlags,
    Protocol, PublishFlags, RecordItem, ResolvedService, ServiceItem, IF_UNSPEC,
};
use avahi_dbus::Client;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "avahi-dbus")]
#[command(author, version, about = "Query and publish mDNS/DNS-SD services through the Avahi daemon", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the daemon state and host name
    Status,

    /// Show or change the host name
    Hostname {
        /// New host name
        #[arg(long)]
        set: Option<String>,
    },

    /// Browse services of a type (e.g. _http._tcp)
    Browse {
        /// Service type
        service_type: String,

        /// Domain to browse (defaults to the configured domain)
        #[arg(short, long)]
        domain: Option<String>,

        /// Resolve every service found
        #[arg(short, long)]
        resolve: bool,

        /// Keep browsing after the initial results, until Ctrl-C
        #[arg(short, long)]
        follow: bool,

        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Resolve a single service
    Resolve {
        /// Service instance name
        name: String,

        /// Service type
        service_type: String,

        #[arg(short, long)]
        domain: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Browse DNS records of a name
    Records {
        /// Record name (e.g. myhost.local)
        name: String,

        /// Record type (A, AAAA, PTR, SRV, TXT, ... or a number)
        #[arg(short = 't', long = "type", default_value = "A")]
        record_type: String,

        /// Record class (IN, ANY or a number)
        #[arg(short, long, default_value = "IN")]
        class: String,

        /// Ask the daemon to reconfirm every record found
        #[arg(long)]
        reconfirm: bool,

        #[arg(long)]
        json: bool,
    },

    /// Publish a service until Ctrl-C
    Publish {
        /// Service instance name
        name: String,

        /// Service type
        service_type: String,

        /// Port number
        port: u16,

        /// TXT entry (key=value), may be repeated
        #[arg(long = "txt")]
        txt: Vec<String>,

        /// Subtype (e.g. _printer._sub._http._tcp), may be repeated
        #[arg(long = "subtype")]
        subtypes: Vec<String>,

        #[arg(short, long)]
        domain: Option<String>,
    },

    /// Configure settings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Write the configuration file with current values
        #[arg(long)]
        init: bool,
    },
}

fn init_logging(verbose: bool, level: &str) {
    let filter = if verbose {
        EnvFilter::new("avahi_dbus=debug,zbus=info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("avahi_dbus={},zbus=warn", level)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loaded = Config::load();
    let level = loaded
        .as_ref()
        .map(|config| config.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(cli.verbose, &level);

    if let Commands::Config { show, init } = cli.command {
        if init {
            config::init()?;
        } else if show {
            config::show()?;
        } else {
            println!("Use --show to view or --init to write the configuration");
        }
        return Ok(());
    }

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            warn!("Ignoring configuration: {}", e);
            Config::default()
        }
    };
    let (client, presence) = connect(&config).await?;

    match cli.command {
        Commands::Status => status(&client).await?,

        Commands::Hostname { set } => match set {
            Some(name) => {
                wait(|done| client.set_host_name(&name, done)).await?;
                println!("Host name change to '{}' requested", name);
            }
            None => println!("{}", wait(|done| client.get_host_name(done)).await?),
        },

        Commands::Browse {
            service_type,
            domain,
            resolve,
            follow,
            json,
        } => {
            let domain = domain.unwrap_or_else(|| config.browse.domain.clone());
            let options = BrowseOptions {
                protocol: config.browse.protocol.protocol(),
                resolve,
                follow,
                json,
            };
            browse(&client, presence, &service_type, &domain, options).await?;
        }

        Commands::Resolve {
            name,
            service_type,
            domain,
            json,
        } => {
            let domain = domain.unwrap_or_else(|| config.browse.domain.clone());
            let target = ServiceTarget {
                interface: IF_UNSPEC,
                protocol: config.browse.protocol.protocol(),
                name: &name,
                service_type: &service_type,
                domain: &domain,
            };
            let service = resolve_once(&client, target).await?;
            print_resolved(&service, json)?;
        }

        Commands::Records {
            name,
            record_type,
            class,
            reconfirm,
            json,
        } => {
            let Some(record_type) = dns_type::parse(&record_type) else {
                bail!("Unknown record type '{}'", record_type);
            };
            let Some(class) = parse_class(&class) else {
                bail!("Unknown record class '{}'", class);
            };
            let protocol = config.browse.protocol.protocol();
            records(&client, presence, &name, protocol, class, record_type, reconfirm, json)
                .await?;
        }

        Commands::Publish {
            name,
            service_type,
            port,
            txt,
            subtypes,
            domain,
        } => {
            let domain = domain.unwrap_or_else(|| config.browse.domain.clone());
            let service = Publication {
                protocol: config.browse.protocol.protocol(),
                name: &name,
                service_type: &service_type,
                domain: &domain,
                port,
                txt: txt.into_iter().map(String::into_bytes).collect(),
                subtypes: &subtypes,
            };
            publish(&client, presence, service).await?;
        }

        Commands::Config { .. } => {}
    }

    Ok(())
}

/// Run an operation and wait for its completion.
async fn wait<T, I>(issue: I) -> anyhow::Result<T>
where
    T: Send + 'static,
    I: FnOnce(Box<dyn FnOnce(client::Result<T>) + Send>),
{
    let (tx, rx) = oneshot::channel();
    issue(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    Ok(rx.await.context("Operation was abandoned")??)
}

/// Connect to the daemon. The receiver reports later availability changes.
async fn connect(config: &Config) -> anyhow::Result<(Client, mpsc::UnboundedReceiver<bool>)> {
    let client = Client::system(&config.bus);
    let (tx, mut presence) = mpsc::unbounded_channel();

    let appeared = tx.clone();
    client.on_connected().connect(move |_| {
        let _ = appeared.send(true);
    });
    client.on_disconnected().connect(move |_| {
        let _ = tx.send(false);
    });
    client.connect();

    match tokio::time::timeout(CONNECT_TIMEOUT, presence.recv()).await {
        Ok(Some(true)) => {
            debug!("Connected to {}", config.bus.service_name);
            Ok((client, presence))
        }
        _ => bail!(
            "{} is not available on the {} bus",
            config.bus.service_name,
            config.bus.kind
        ),
    }
}

async fn status(client: &Client) -> anyhow::Result<()> {
    let state = wait(|done| client.get_server_state(done)).await?;
    let host = wait(|done| client.get_host_name(done)).await?;

    println!("State:     {}", state);
    println!("Host name: {}", host);
    if !state.is_running() {
        warn!("The daemon is not running yet; publishing may fail");
    }
    Ok(())
}

fn parse_class(s: &str) -> Option<u16> {
    match s.to_ascii_uppercase().as_str() {
        "IN" => Some(dns_class::IN),
        "ANY" => Some(dns_class::ANY),
        other => other.parse().ok(),
    }
}

/// Browser events forwarded to the command loop.
enum Found<T> {
    New(T),
    Remove(T),
    AllForNow,
    Failure(String),
    ErrorLog(String),
}

macro_rules! forward_browser_events {
    ($browser:expr, $tx:expr) => {{
        let browser = $browser;
        let tx = $tx;

        let sender = tx.clone();
        browser.on_item_new().connect(move |item| {
            let _ = sender.send(Found::New(item.clone()));
        });
        let sender = tx.clone();
        browser.on_item_remove().connect(move |item| {
            let _ = sender.send(Found::Remove(item.clone()));
        });
        let sender = tx.clone();
        browser.on_failure().connect(move |error| {
            let _ = sender.send(Found::Failure(error.clone()));
        });
        let sender = tx.clone();
        browser.on_all_for_now().connect(move || {
            let _ = sender.send(Found::AllForNow);
        });
        browser.on_error_log().connect(move |message| {
            let _ = tx.send(Found::ErrorLog(message.clone()));
        });
    }};
}

fn forward_services(browser: &ServiceBrowser, tx: mpsc::UnboundedSender<Found<ServiceItem>>) {
    forward_browser_events!(browser, tx);
}

fn forward_records(browser: &RecordBrowser, tx: mpsc::UnboundedSender<Found<RecordItem>>) {
    forward_browser_events!(browser, tx);
}

/// Next browser event, `None` on Ctrl-C.
async fn next_event<T>(
    events: &mut mpsc::UnboundedReceiver<Found<T>>,
    presence: &mut mpsc::UnboundedReceiver<bool>,
) -> anyhow::Result<Option<Found<T>>> {
    loop {
        tokio::select! {
            event = events.recv() => return Ok(event),
            available = presence.recv() => {
                if !matches!(available, Some(true)) {
                    bail!("The Avahi daemon went away");
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(None),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

#[derive(Serialize)]
struct Change<'a, T> {
    event: &'a str,
    #[serde(flatten)]
    item: &'a T,
}

fn print_service(sign: char, item: &ServiceItem, json: bool) -> anyhow::Result<()> {
    if json {
        let event = if sign == '+' { "new" } else { "remove" };
        return print_json(&Change { event, item });
    }
    println!(
        "{} {:>3} {:<4} {:<32} {:<16} {}",
        sign,
        item.interface,
        item.protocol.to_string(),
        item.name,
        item.service_type,
        item.domain
    );
    Ok(())
}

fn print_resolved(service: &ResolvedService, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(service);
    }
    println!(
        "= {:>3} {:<4} {:<32} {:<16} {}",
        service.interface,
        service.protocol.to_string(),
        service.name,
        service.service_type,
        service.domain
    );
    println!("   hostname = [{}]", service.host);
    println!("   address = [{}]", service.address);
    println!("   port = [{}]", service.port);
    println!("   txt = {:?}", service.txt_strings());
    Ok(())
}

fn print_record(sign: char, item: &RecordItem, json: bool) -> anyhow::Result<()> {
    if json {
        let event = if sign == '+' { "new" } else { "remove" };
        return print_json(&Change { event, item });
    }
    println!(
        "{} {:>3} {:<4} {} class={} type={} rdata={}",
        sign,
        item.interface,
        item.protocol.to_string(),
        item.name,
        item.class,
        item.record_type,
        hex::encode(&item.rdata)
    );
    Ok(())
}

struct BrowseOptions {
    protocol: Protocol,
    resolve: bool,
    follow: bool,
    json: bool,
}

async fn browse(
    client: &Client,
    mut presence: mpsc::UnboundedReceiver<bool>,
    service_type: &str,
    domain: &str,
    options: BrowseOptions,
) -> anyhow::Result<()> {
    let (tx, mut events) = mpsc::unbounded_channel();
    let browser = wait(|done| {
        client.create_service_browser(
            IF_UNSPEC,
            options.protocol,
            service_type,
            domain,
            LookupFlags::empty(),
            move |result: client::Result<Arc<ServiceBrowser>>| {
                if let Ok(browser) = &result {
                    forward_services(browser, tx);
                }
                done(result);
            },
        )
    })
    .await?;
    info!("Browsing {} on {}", service_type, browser.path());

    while let Some(event) = next_event(&mut events, &mut presence).await? {
        match event {
            Found::New(item) => {
                print_service('+', &item, options.json)?;
                if options.resolve {
                    let target = ServiceTarget {
                        interface: item.interface,
                        protocol: item.protocol,
                        name: &item.name,
                        service_type: &item.service_type,
                        domain: &item.domain,
                    };
                    match resolve_once(client, target).await {
                        Ok(service) => print_resolved(&service, options.json)?,
                        Err(e) => warn!("{}", e),
                    }
                }
            }
            Found::Remove(item) => print_service('-', &item, options.json)?,
            Found::AllForNow if !options.follow => break,
            Found::AllForNow => debug!("Initial results complete"),
            Found::Failure(error) => bail!("Browsing failed: {}", error),
            Found::ErrorLog(message) => warn!("{}", message),
        }
    }

    Ok(())
}

struct ServiceTarget<'a> {
    interface: Interface,
    protocol: Protocol,
    name: &'a str,
    service_type: &'a str,
    domain: &'a str,
}

/// Resolve a service and wait for the first answer.
async fn resolve_once(client: &Client, target: ServiceTarget<'_>) -> anyhow::Result<ResolvedService> {
    let (tx, mut answers) = mpsc::unbounded_channel();
    let resolver = wait(|done| {
        client.create_service_resolver(
            target.interface,
            target.protocol,
            target.name,
            target.service_type,
            target.domain,
            Protocol::Unspec,
            LookupFlags::empty(),
            move |result: client::Result<Arc<client::ServiceResolver>>| {
                if let Ok(resolver) = &result {
                    let found = tx.clone();
                    resolver.on_found().connect(move |service| {
                        let _ = found.send(Ok(service.clone()));
                    });
                    resolver.on_failure().connect(move |error| {
                        let _ = tx.send(Err(error.clone()));
                    });
                }
                done(result);
            },
        )
    })
    .await?;

    let answer = tokio::time::timeout(RESOLVE_TIMEOUT, answers.recv()).await;
    drop(resolver);

    match answer {
        Ok(Some(Ok(service))) => Ok(service),
        Ok(Some(Err(error))) => bail!("Failed to resolve '{}': {}", target.name, error),
        Ok(None) | Err(_) => bail!("Timed out resolving '{}'", target.name),
    }
}

#[allow(clippy::too_many_arguments)]
async fn records(
    client: &Client,
    mut presence: mpsc::UnboundedReceiver<bool>,
    name: &str,
    protocol: Protocol,
    class: u16,
    record_type: u16,
    reconfirm: bool,
    json: bool,
) -> anyhow::Result<()> {
    let (tx, mut events) = mpsc::unbounded_channel();
    let browser = wait(|done| {
        client.create_record_browser(
            IF_UNSPEC,
            protocol,
            name,
            class,
            record_type,
            LookupFlags::empty(),
            move |result: client::Result<Arc<RecordBrowser>>| {
                if let Ok(browser) = &result {
                    forward_records(browser, tx);
                }
                done(result);
            },
        )
    })
    .await?;
    debug!("Record browser at {}", browser.path());

    let mut found = Vec::new();
    while let Some(event) = next_event(&mut events, &mut presence).await? {
        match event {
            Found::New(item) => {
                print_record('+', &item, json)?;
                found.push(item);
            }
            Found::Remove(item) => {
                print_record('-', &item, json)?;
                found.retain(|known| *known != item);
            }
            Found::AllForNow => break,
            Found::Failure(error) => bail!("Browsing records failed: {}", error),
            Found::ErrorLog(message) => warn!("{}", message),
        }
    }
    drop(browser);

    if reconfirm {
        for item in &found {
            let result = wait(|done| {
                client.reconfirm_record(
                    item.interface,
                    item.protocol,
                    &item.name,
                    item.class,
                    item.record_type,
                    item.rdata.clone(),
                    done,
                )
            })
            .await;
            match result {
                Ok(()) => info!("Reconfirming {} on interface {}", item.name, item.interface),
                Err(e) => warn!("Cannot reconfirm {}: {}", item.name, e),
            }
        }
    }

    Ok(())
}

struct Publication<'a> {
    protocol: Protocol,
    name: &'a str,
    service_type: &'a str,
    domain: &'a str,
    port: u16,
    txt: Vec<Vec<u8>>,
    subtypes: &'a [String],
}

async fn publish(
    client: &Client,
    mut presence: mpsc::UnboundedReceiver<bool>,
    service: Publication<'_>,
) -> anyhow::Result<()> {
    let (tx, mut states) = mpsc::unbounded_channel::<EntryGroupStateChange>();
    let group = wait(|done| {
        client.create_entry_group(move |result: client::Result<Arc<EntryGroup>>| {
            if let Ok(group) = &result {
                group.on_state_changed().connect(move |change| {
                    let _ = tx.send(change.clone());
                });
                group.on_error_log().connect(|message| warn!("{}", message));
            }
            done(result);
        })
    })
    .await?;

    let Publication {
        protocol,
        name,
        service_type,
        domain,
        port,
        txt,
        subtypes,
    } = service;

    wait(|done| {
        group.add_service(
            IF_UNSPEC,
            protocol,
            PublishFlags::empty(),
            name,
            service_type,
            domain,
            "",
            port,
            txt,
            done,
        )
    })
    .await
    .context("Failed to add service")?;

    for subtype in subtypes {
        wait(|done| {
            group.add_service_subtype(
                IF_UNSPEC,
                protocol,
                PublishFlags::empty(),
                name,
                service_type,
                domain,
                subtype,
                done,
            )
        })
        .await
        .with_context(|| format!("Failed to add subtype {}", subtype))?;
    }

    wait(|done| group.commit(done))
        .await
        .context("Failed to commit entry group")?;
    info!("Publishing '{}' ({}) on port {}", name, service_type, port);

    loop {
        tokio::select! {
            change = states.recv() => {
                let Some(change) = change else { break };
                match change.state {
                    EntryGroupState::Established => println!("Established '{}'", name),
                    EntryGroupState::Collision => {
                        bail!("Service name '{}' collides with an existing service", name)
                    }
                    EntryGroupState::Failure => bail!("Publishing failed: {}", change.error),
                    other => debug!("Entry group is {}", other),
                }
            }
            available = presence.recv() => {
                if !matches!(available, Some(true)) {
                    bail!("The Avahi daemon went away");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Withdrawing '{}'", name);
                break;
            }
        }
    }

    drop(group);
    // Let the Free call go out before the runtime shuts down
    tokio::task::yield_now().await;
    Ok(())
}
