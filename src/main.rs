/*!
Open the user database and, optionally, look a user up by login.

```text
tirocinio [CONFIG_FILE [LOGIN]]
```
*/
use simplelog::{ColorChoice, TerminalMode, TermLogger};

use tirocinio::config;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let log_cfg = simplelog::ConfigBuilder::new()
        .add_filter_allow_str("tirocinio")
        .build();
    if let Err(e) = TermLogger::init(
        tirocinio::log_level_from_env(),
        log_cfg,
        TerminalMode::Stdout,
        ColorChoice::Auto
    ) {
        eprintln!("Unable to start logging: {}", &e);
    }
    log::info!("Logging started.");

    let mut args = std::env::args().skip(1);

    let cfg = match args.next() {
        Some(path) => match config::Cfg::from_file(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::error!("Error loading {:?}: {}", &path, &e);
                std::process::exit(1);
            },
        },
        None => config::Cfg::default(),
    };

    let mgr = match config::load_configuration(&cfg).await {
        Ok(mgr) => mgr,
        Err(e) => {
            log::error!("{}", &e);
            std::process::exit(1);
        },
    };

    if let Some(login) = args.next() {
        match mgr.find_by_login(login.as_str()).await {
            Ok(Some(u)) => { println!("{:#?}", &u); },
            Ok(None) => { println!("No user with login {:?}.", &login); },
            Err(e) => {
                log::error!("Error looking up {:?}: {}", &login, &e);
                std::process::exit(1);
            },
        }
    }
}
