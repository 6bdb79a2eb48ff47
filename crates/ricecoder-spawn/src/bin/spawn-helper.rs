//! Test companion for ricecoder-spawn
//!
//! Arguments are case-insensitive and applied in this order:
//!
//! - `OUTPUT` / `ERROR`: echo stdin (or `VALUE` when stdin is a terminal) to
//!   stdout / stderr
//! - `LINES=n`: write `LINE_1` .. `LINE_n` to stdout
//! - `CWD`: write the current directory to stdout
//! - `ENV=KEY`: write the value of `KEY` (empty if unset) to stdout
//! - `SLEEP=ms`: sleep before exiting
//! - `EXIT=code`: exit with `code` instead of 0

use std::io::{self, IsTerminal, Read, Write};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Default)]
struct Plan {
    output: bool,
    error: bool,
    lines: usize,
    cwd: bool,
    env: Vec<String>,
    sleep_ms: u64,
    exit: u8,
}

fn parse(args: impl Iterator<Item = String>) -> Result<Plan, String> {
    let mut plan = Plan::default();
    let mut any = false;

    for arg in args {
        any = true;
        let (key, value) = match arg.split_once('=') {
            Some((key, value)) => (key.to_ascii_uppercase(), Some(value.to_string())),
            None => (arg.to_ascii_uppercase(), None),
        };
        let number = |value: Option<String>| -> Result<u64, String> {
            value
                .ok_or_else(|| format!("{key} needs a value"))?
                .parse()
                .map_err(|e| format!("{key}: {e}"))
        };

        match key.as_str() {
            "OUTPUT" => plan.output = true,
            "ERROR" => plan.error = true,
            "CWD" => plan.cwd = true,
            "LINES" => plan.lines = usize::try_from(number(value)?).map_err(|e| e.to_string())?,
            "SLEEP" => plan.sleep_ms = number(value)?,
            "EXIT" => plan.exit = u8::try_from(number(value)?).map_err(|e| e.to_string())?,
            "ENV" => plan.env.push(value.ok_or("ENV needs a variable name")?),
            other => return Err(format!("unknown argument {other}")),
        }
    }

    if !any {
        return Err("expected at least one argument".to_string());
    }
    Ok(plan)
}

fn run(plan: &Plan) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if plan.output || plan.error {
        let stdin = io::stdin();
        let value = if stdin.is_terminal() {
            "VALUE".to_string()
        } else {
            let mut buf = String::new();
            stdin.lock().read_to_string(&mut buf)?;
            buf
        };
        if plan.output {
            out.write_all(value.as_bytes())?;
        }
        if plan.error {
            io::stderr().write_all(value.as_bytes())?;
        }
    }

    for i in 1..=plan.lines {
        writeln!(out, "LINE_{i}")?;
    }
    if plan.cwd {
        writeln!(out, "{}", std::env::current_dir()?.display())?;
    }
    for key in &plan.env {
        writeln!(out, "{}", std::env::var(key).unwrap_or_default())?;
    }
    out.flush()?;

    if plan.sleep_ms > 0 {
        std::thread::sleep(Duration::from_millis(plan.sleep_ms));
    }
    Ok(())
}

fn main() -> ExitCode {
    let plan = match parse(std::env::args().skip(1)) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("spawn-helper: {e}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = run(&plan) {
        eprintln!("spawn-helper: {e}");
        return ExitCode::from(1);
    }
    ExitCode::from(plan.exit)
}
