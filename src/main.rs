use rampart::{Disposition, Engine};
use std::io::{self, Read};

fn main() {
    let config = match parse_args() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let mut engine = Engine::new();
    for path in &config.rule_files {
        if let Err(err) = engine.load_file(path) {
            eprintln!("error: {path}: {err}");
            std::process::exit(1);
        }
    }
    for directive in &config.directives {
        if let Err(err) = engine.load(directive) {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
    if let Err(err) = engine.init() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }

    let headers: Vec<(&str, &str)> =
        config.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let body: Vec<&str> = config.body.iter().map(String::as_str).collect();

    let mut tx = engine.make_transaction();
    if let Some(client) = &config.client {
        tx.process_connection(client, 0, "127.0.0.1", 80);
    }
    tx.process_uri(&config.uri, &config.method, "HTTP/1.1");

    let mut on_match = |rule: &rampart::Rule| {
        println!("matched rule {} (phase {})", rule.id, rule.phase.number());
    };
    let mut disposition = tx.process_request_headers(&headers, &mut on_match);
    if !disposition.is_disruptive() {
        disposition = tx.process_request_body(&body, &mut on_match);
    }
    tx.process_logging(&mut on_match);

    match disposition {
        Disposition::Pass => {
            println!("disposition: pass");
        }
        Disposition::Allow(scope) => {
            println!("disposition: allow ({scope:?})");
        }
        other => {
            println!("disposition: {other:?}");
            std::process::exit(3);
        }
    }
}

struct CliConfig {
    rule_files: Vec<String>,
    directives: Vec<String>,
    uri: String,
    method: String,
    headers: Vec<(String, String)>,
    body: Vec<String>,
    client: Option<String>,
}

fn parse_args() -> Result<CliConfig, String> {
    let mut config = CliConfig {
        rule_files: Vec::new(),
        directives: Vec::new(),
        uri: "/".to_string(),
        method: "GET".to_string(),
        headers: Vec::new(),
        body: Vec::new(),
        client: None,
    };
    let mut read_body_stdin = false;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next().ok_or_else(|| format!("error: {name} expects a value"))
        };
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-V" | "--version" => {
                println!("rampart {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-r" | "--rules" => config.rule_files.push(value("--rules")?),
            "-d" | "--directive" => config.directives.push(value("--directive")?),
            "-u" | "--uri" => config.uri = value("--uri")?,
            "-m" | "--method" => config.method = value("--method")?,
            "-H" | "--header" => {
                let header = value("--header")?;
                let (key, val) = header
                    .split_once(':')
                    .ok_or_else(|| format!("error: bad header '{header}' (expected k:v)"))?;
                config.headers.push((key.trim().to_string(), val.trim().to_string()));
            }
            "-b" | "--body" => config.body.push(value("--body")?),
            "--body-stdin" => read_body_stdin = true,
            "-c" | "--client" => config.client = Some(value("--client")?),
            _ => return Err(format!("error: unknown option '{arg}'")),
        }
    }

    if read_body_stdin {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|err| format!("error: failed to read stdin: {err}"))?;
        config.body.push(buffer);
    }

    if config.rule_files.is_empty() && config.directives.is_empty() {
        return Err(format!("error: no rules provided\n\n{}", help_text()));
    }

    Ok(config)
}

fn print_help() {
    println!("{}", help_text());
}

fn help_text() -> String {
    format!(
        "rampart {version}

SecLang rule engine CLI: load rules, evaluate one request, print matches.

Usage:
  rampart --rules <file> [OPTIONS]
  rampart --directive <text> [OPTIONS]

Options:
  -r, --rules <file>       Rule file to load (repeatable).
  -d, --directive <text>   Inline directive to load (repeatable).
  -u, --uri <uri>          Request URI, default '/'.
  -m, --method <method>    Request method, default GET.
  -H, --header <k:v>       Request header (repeatable).
  -b, --body <text>        Request body chunk (repeatable).
      --body-stdin         Append stdin as a request body chunk.
  -c, --client <ip>        Client address for REMOTE_ADDR.
  -h, --help               Show this help message.
  -V, --version            Print version information.

Exit codes:
  0  Request passed (or was allowed).
  1  Rule load or engine error.
  2  Invalid arguments.
  3  Request drew a disruptive disposition.
",
        version = env!("CARGO_PKG_VERSION")
    )
}
