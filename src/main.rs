fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if handle_cli_flags(&args) {
        return;
    }

    let mut positional = args.iter().filter(|arg| !arg.starts_with('-'));
    let vod_id = positional.next().cloned();
    let local_file = positional.next().map(std::path::PathBuf::from);
    if let Err(err) = vodchat::run(vodchat::app::RunOptions { vod_id, local_file }) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn handle_cli_flags(args: &[String]) -> bool {
    let mut saw_flag = false;
    for arg in args {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("VODChat {}", vodchat::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!(
                    "VODChat — Replay archived stream VODs with synchronized chat.\n\nUsage: vodchat [OPTIONS] [VOD_ID]\n\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message\n  --check-updates      Check for updates and exit"
                );
                saw_flag = true;
            }
            "--check-updates" => {
                saw_flag = true;
                if let Err(err) = check_updates_once() {
                    eprintln!("Update check failed: {err:?}");
                    std::process::exit(1);
                }
            }
            _ => {}
        }
    }
    saw_flag
}

fn check_updates_once() -> anyhow::Result<()> {
    use semver::Version;

    let skip_env = vodchat::update::SKIP_UPDATE_ENV;
    if std::env::var(skip_env).is_ok() {
        println!("Update check skipped: {skip_env} is set.");
        return Ok(());
    }

    let current = Version::parse(vodchat::VERSION)?;
    match vodchat::update::check_for_update(&current)? {
        Some(info) => {
            let vodchat::update::UpdateInfo { version, url } = info;
            println!("Update available: {current} -> {version}\n{url}");
        }
        None => {
            println!("VODChat {current} is up to date.");
        }
    }
    Ok(())
}
