use crate::session::open_console;
use crate::utils::parse_time_expression;
use chrono::Utc;
use color_eyre::Result;
use reqguard_countdown::{CountdownEngine, CountdownInput, CountdownView, DurationSpec, Mode, evaluate};
use reqguard_session::{CONFIG_FILE_NAME, ConsoleConfig};
use std::path::Path;

/// Arguments of `reqguard countdown`.
#[derive(Debug, Clone)]
pub struct CountdownArgs {
    pub since: String,
    pub days: Option<u32>,
    pub months: Option<u32>,
    pub status: String,
    pub watch: bool,
    pub json: bool,
}

pub fn build_input(args: &CountdownArgs) -> Result<CountdownInput> {
    Ok(CountdownInput {
        reference_time: parse_time_expression(&args.since, Utc::now())?,
        duration: DurationSpec::from_fields(args.days, args.months),
        status: args.status.trim().to_string(),
    })
}

fn render(view: &CountdownView, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string(view)?);
    }
    let marker = match Mode::of(view) {
        Mode::Inactive => "·",
        Mode::Active => "⏳",
        Mode::Overdue => "⚠️",
    };
    Ok(format!("{marker} {}", view.text))
}

pub async fn handle_countdown_command(data_dir: &Path, args: CountdownArgs) -> Result<()> {
    let input = build_input(&args)?;

    if !args.watch {
        let policy = ConsoleConfig::load_or_default(&data_dir.join(CONFIG_FILE_NAME))?.countdown;
        println!("{}", render(&evaluate(&policy, &input, Utc::now()), args.json)?);
        return Ok(());
    }

    let console = open_console(data_dir)?;
    watch(console.countdown(input), args.json).await
}

async fn watch(engine: CountdownEngine, json: bool) -> Result<()> {
    let mut views = engine.subscribe();

    println!("{}", render(&views.borrow_and_update(), json)?);
    if Mode::of(&engine.current()) == Mode::Inactive {
        return Ok(());
    }

    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                println!("{}", render(&view, json)?);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
