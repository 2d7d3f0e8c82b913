//! chromedbg
//!
//! Attaches to a JavaScript VM's remote debugger, runs one operation and prints the
//! result. Options supported:
//!   -h/--host       Host the debugger listens on, defaults to localhost
//!   -p/--port       Port the debugger listens on
//!   -P/--protocol   Protocol to speak, `v8` (default) or `wip`
//!   -s/--handshake  V8 handshake, `standalone` (default), `chromium` or `none`
//!   -t/--tab        Index of the tab to debug with `wip`, defaults to 0
//!   --log-traffic   Log raw traffic at trace level
//!
//! The operation follows the options, e.g.
//! ```
//! chromedbg -p 5858 evaluate '1 + 1'
//! chromedbg -P wip -p 9222 tabs
//! ```
//! Operations are `version`, `scripts`, `evaluate <expr>`, `source <script-id>` and
//! `tabs`. Logging is controlled with RUST_LOG.

use std::io;
use std::process;

use clap::{App, AppSettings, Arg, ArgMatches};
use tokio::runtime;

use chromedbg_core::config::Config;

mod operations;
use operations::{Operation, Options};

fn get_app_args<'a>() -> ArgMatches<'a> {
    App::new("chromedbg")
        .version("0.1.0")
        .author("Steven Trotter <stevetrot@gmail.com>")
        .about("Remote debugger client for JavaScript VMs")
        .long_about("Attaches to a V8 debugger agent or a browser tab over the WebKit Inspector Protocol and runs a single debugging operation.")
        .setting(AppSettings::TrailingVarArg)
        .arg(Arg::with_name("host")
                 .short("h")
                 .long("host")
                 .takes_value(true)
                 .help("specify host the debugger listens on"))
        .arg(Arg::with_name("port")
                 .short("p")
                 .long("port")
                 .takes_value(true)
                 .required(true)
                 .help("specify port the debugger listens on"))
        .arg(Arg::with_name("protocol")
                 .short("P")
                 .long("protocol")
                 .takes_value(true)
                 .help("specify protocol from [v8, wip]"))
        .arg(Arg::with_name("handshake")
                 .short("s")
                 .long("handshake")
                 .takes_value(true)
                 .help("specify V8 handshake from [standalone, chromium, none]"))
        .arg(Arg::with_name("tab")
                 .short("t")
                 .long("tab")
                 .takes_value(true)
                 .help("specify index of the tab to debug"))
        .arg(Arg::with_name("log_traffic")
                 .long("log-traffic")
                 .help("log raw traffic at trace level"))
        .arg(Arg::with_name("operation")
                 .required(true)
                 .multiple(true)
                 .takes_value(true))
        .get_matches()
}

fn get_options(args: &ArgMatches) -> chromedbg_core::Result<Options> {
    let port = args
        .value_of("port")
        .unwrap_or_default()
        .parse::<u16>()
        .map_err(|_| chromedbg_core::Error::InvalidState("Can't understand port".to_string()))?;

    let tab = match args.value_of("tab") {
        None => 0,
        Some(s) => s.parse::<usize>().map_err(|_| {
            chromedbg_core::Error::InvalidState("Can't understand tab index".to_string())
        })?,
    };

    let operation: Vec<String> = args
        .values_of("operation")
        .map(|values| values.map(|x| x.to_string()).collect())
        .unwrap_or_default();

    Ok(Options {
        host: args.value_of("host").unwrap_or("localhost").to_string(),
        port,
        protocol: operations::parse_protocol(args.value_of("protocol"))?,
        handshake: operations::parse_handshake(args.value_of("handshake"))?,
        tab,
        log_traffic: args.is_present("log_traffic"),
        operation: Operation::from_args(&operation)?,
    })
}

fn main() -> io::Result<()> {
    env_logger::init();

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    let args = get_app_args();

    let result = rt.block_on(async {
        let options = get_options(&args)?;
        operations::run(&options, Config::new()).await
    });

    match result {
        Ok(lines) => {
            for line in lines {
                println!("{}", line);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("chromedbg: {}", e);
            process::exit(1);
        }
    }
}
