use anyhow::{bail, Context, Result};
use crossterm::style::{style, Color, Stylize};
use madder::grammar::AttrClass;
use madder::{loader, Buffer, GrammarStore, Highlighter, NullHooks, RuleSet};
use std::path::PathBuf;
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut grammar_name: Option<String> = None;
    let mut file: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--grammar" | "-g" => {
                grammar_name = Some(args.next().context("--grammar needs a name")?);
            }
            "--help" | "-h" => {
                println!("usage: madder [--grammar NAME] FILE");
                return Ok(());
            }
            _ => file = Some(PathBuf::from(arg)),
        }
    }
    let path = match file {
        Some(p) => p,
        None => bail!("usage: madder [--grammar NAME] FILE"),
    };

    let store = Rc::new(GrammarStore::new());
    for dir in grammar_dirs() {
        if dir.is_dir() {
            let loaded = loader::load_dir(&dir, &store)?;
            tracing::debug!(dir = %dir.display(), loaded, "loaded grammars");
        }
    }

    let set = match &grammar_name {
        Some(name) => store
            .resolve(name)
            .with_context(|| format!("no grammar named '{name}' is loaded"))?,
        None => path
            .extension()
            .and_then(|e| store.by_extension(&e.to_string_lossy()))
            .unwrap_or_else(|| store.insert(RuleSet::plain())),
    };
    tracing::info!(grammar = %set.name, file = %path.display(), "highlighting");

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let buffer = Buffer::from_string(text);

    let mut highlighter = Highlighter::new(Rc::clone(&store), Rc::clone(&set));
    highlighter.rehighlight(&buffer, &mut NullHooks);
    while highlighter.is_pending() {
        highlighter.resume(&buffer, &mut NullHooks);
    }

    for line_idx in 0..buffer.len_lines() {
        let line = Buffer::line(&buffer, line_idx);
        let mut chars = line.chars();
        if let Some(spans) = highlighter.spans(line_idx) {
            for span in spans {
                let piece: String = chars.by_ref().take(span.length).collect();
                let class = set.attribute(span.attr).class;
                match color_for(class) {
                    Some(color) => print!("{}", style(piece).with(color)),
                    None => print!("{piece}"),
                }
            }
        }
        // anything left uncovered (shouldn't happen) prints unstyled
        let rest: String = chars.collect();
        println!("{rest}");
    }

    Ok(())
}

/// Grammar search path: `grammars/` next to the working directory, then
/// the per-user config directory.
fn grammar_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from("grammars")];
    if let Some(config) = dirs::config_dir() {
        dirs.push(config.join("madder").join("grammars"));
    }
    dirs
}

fn color_for(class: AttrClass) -> Option<Color> {
    match class {
        AttrClass::Code => None,
        AttrClass::String | AttrClass::Char | AttrClass::HereDoc => Some(Color::DarkGreen),
        AttrClass::Comment | AttrClass::BlockComment => Some(Color::DarkGrey),
        AttrClass::Other => Some(Color::DarkYellow),
    }
}
