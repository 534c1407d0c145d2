//! The chainsetup text format.
//!
//! A chainsetup file is a flat sequence of options; `#` starts a comment
//! running to end of line. Tokens are whitespace-separated with
//! double-quote grouping; a backslash escapes the next character, and an
//! escaped comma (`\,`) survives tokenization so option arguments can
//! contain literal commas.
//!
//! Recognized option families:
//!
//! | option | meaning |
//! |---|---|
//! | `-b:frames` | block size override |
//! | `-n:name` | chainsetup name |
//! | `-B:mode` | pin buffering mode (`auto`, `nonrt`, `rt`, `rtlowlatency`) |
//! | `-r[:prio]` | raised priority |
//! | `-sr:rate` | nominal sample rate |
//! | `-f:enc,ch,rate[,i\|n]` | default audio format |
//! | `-t:secs` / `-tl` | processing length / looping |
//! | `-z:feature[,arg]` | toggles (`db`, `nodb`, `psr`, `nopsr`, `multitrack`, `nomultitrack`, `ignore_xruns`, `noignore_xruns`) |
//! | `-a:name,...` | select (and create) chains |
//! | `-i:label` / `-o:label` | attach input / output to selected chains |
//! | `-ea`, `-chcopy`, `-dcfix` | operators |
//! | `-kos`, `-kl` | controllers for the selected operator |
//! | `-Md:device` | MIDI device |
//!
//! `serialize` emits a canonical form for which `parse ∘ serialize` is the
//! identity up to token order within a section.

use std::fmt::Write as _;

use thiserror::Error;
use tracing::debug;

use cadena_core::{Amplify, ChannelCopy, ControlSource, DcFix, LinearEnvelope, Operator, SineOscillator};

use crate::bmode::BufferingMode;
use crate::error::Result;
use crate::resources::Resources;
use crate::setup::Chainsetup;

/// Errors from tokenizing or interpreting chainsetup text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// A double-quoted group was not closed.
    #[error("unterminated quote starting at byte {0}")]
    UnterminatedQuote(usize),

    /// The option is not recognized.
    #[error("unknown option '{0}'")]
    UnknownOption(String),

    /// The option needs an argument it did not get.
    #[error("option '{option}' is missing an argument")]
    MissingArgument {
        /// The option token.
        option: String,
    },

    /// An argument did not parse.
    #[error("bad argument for '{option}': {message}")]
    BadArgument {
        /// The option token.
        option: String,
        /// What was wrong.
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

/// Split chainsetup text into option tokens.
///
/// Strips comments, resolves whitespace and quote grouping, and resolves
/// every escape except `\,`, which is kept for the argument splitter.
pub fn tokenize(text: &str) -> std::result::Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quote_start = 0;
    let mut escaped = false;
    let mut in_comment = false;

    for (pos, ch) in text.char_indices() {
        if in_comment {
            if ch == '\n' {
                in_comment = false;
            }
            continue;
        }
        if escaped {
            if ch == ',' {
                current.push('\\');
            }
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => {
                if !in_quotes {
                    quote_start = pos;
                }
                in_quotes = !in_quotes;
            }
            '#' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                in_comment = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err(ParseError::UnterminatedQuote(quote_start));
    }
    if escaped {
        current.push('\\');
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Split an option argument string on unescaped commas, resolving `\,`.
pub fn split_args(s: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in s.chars() {
        if escaped {
            if ch != ',' {
                current.push('\\');
            }
            current.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == ',' {
            args.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    if escaped {
        current.push('\\');
    }
    args.push(current);
    args
}

/// Resolve `\,` escapes without splitting; used for labels whose commas
/// are structural (`loop,1`).
fn unescape_commas(s: &str) -> String {
    s.replace("\\,", ",")
}

fn escape_commas(s: &str) -> String {
    s.replace(',', "\\,")
}

fn quote_token(s: &str) -> String {
    if s.contains(char::is_whitespace) || s.contains('#') || s.contains('"') {
        format!("\"{}\"", s.replace('"', "\\\""))
    } else {
        s.to_string()
    }
}

/// Format an f64 the way the text format expects: integral values print
/// without a fraction.
fn format_value(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

// ---------------------------------------------------------------------------
// Option interpretation
// ---------------------------------------------------------------------------

fn bad(option: &str, message: impl Into<String>) -> ParseError {
    ParseError::BadArgument {
        option: option.to_string(),
        message: message.into(),
    }
}

fn parse_f64(option: &str, arg: &str) -> std::result::Result<f64, ParseError> {
    arg.parse()
        .map_err(|_| bad(option, format!("'{arg}' is not a number")))
}

/// Interpret a single option token against `setup`.
pub fn interpret_option(setup: &mut Chainsetup, token: &str) -> Result<()> {
    let body = token
        .strip_prefix('-')
        .ok_or_else(|| ParseError::UnknownOption(token.to_string()))?;
    let (head, tail) = match body.split_once(':') {
        Some((h, t)) => (h, Some(t)),
        None => (body, None),
    };
    let require_tail = || {
        tail.filter(|t| !t.is_empty())
            .ok_or(ParseError::MissingArgument {
                option: token.to_string(),
            })
    };

    match head {
        "b" => {
            let arg = require_tail()?;
            let frames: usize = arg
                .parse()
                .ok()
                .filter(|&f| f > 0)
                .ok_or_else(|| bad(token, "block size must be a positive integer"))?;
            setup.set_buffersize(frames);
        }
        "n" => setup.set_name(unescape_commas(require_tail()?)),
        "B" => {
            let arg = require_tail()?;
            if arg == "auto" {
                setup.set_buffering_mode(None);
            } else {
                let mode: BufferingMode = arg
                    .parse()
                    .map_err(|_| bad(token, format!("unknown buffering mode '{arg}'")))?;
                setup.set_buffering_mode(Some(mode));
            }
        }
        "r" => {
            setup.toggle_raised_priority(true);
            if let Some(t) = tail.filter(|t| !t.is_empty()) {
                let prio: i32 = t
                    .parse()
                    .map_err(|_| bad(token, "priority must be an integer"))?;
                setup.set_sched_priority(prio);
            }
        }
        "sr" => {
            let rate: u32 = require_tail()?
                .parse()
                .ok()
                .filter(|&r| r > 0)
                .ok_or_else(|| bad(token, "sample rate must be a positive integer"))?;
            setup.set_samples_per_second(rate)?;
        }
        "f" => {
            let format = require_tail()?
                .parse()
                .map_err(|e| bad(token, format!("{e}")))?;
            setup.set_default_format(format);
        }
        "t" => {
            let secs = parse_f64(token, require_tail()?)?;
            if secs <= 0.0 {
                return Err(bad(token, "length must be positive").into());
            }
            setup.set_length_secs(secs);
        }
        "tl" => setup.toggle_looping(true),
        "z" => {
            let args = split_args(require_tail()?);
            match args[0].as_str() {
                "db" => {
                    setup.toggle_double_buffering(true);
                    if let Some(size) = args.get(1) {
                        let frames: usize = size
                            .parse()
                            .ok()
                            .filter(|&f| f > 0)
                            .ok_or_else(|| bad(token, "double-buffer size must be positive"))?;
                        setup.set_double_buffer_size(frames);
                    }
                }
                "nodb" => setup.toggle_double_buffering(false),
                "psr" => setup.toggle_precise_sample_rates(true),
                "nopsr" => setup.toggle_precise_sample_rates(false),
                "multitrack" => setup.set_multitrack_override(Some(true)),
                "nomultitrack" => setup.set_multitrack_override(Some(false)),
                "ignore_xruns" => setup.toggle_ignore_xruns(true),
                "noignore_xruns" => setup.toggle_ignore_xruns(false),
                other => return Err(bad(token, format!("unknown feature '{other}'")).into()),
            }
        }
        "a" => {
            let names = split_args(require_tail()?);
            setup.select_chains(&names)?;
        }
        "i" => {
            let label = unescape_commas(require_tail()?);
            setup.add_input(&label)?;
        }
        "o" => {
            let label = unescape_commas(require_tail()?);
            setup.add_output(&label)?;
        }
        "ea" | "chcopy" | "dcfix" => {
            let args: Vec<f64> = match tail {
                Some(t) if !t.is_empty() => split_args(t)
                    .iter()
                    .map(|a| parse_f64(token, a))
                    .collect::<std::result::Result<_, _>>()?,
                _ => Vec::new(),
            };
            for chain in setup.selected_chain_names().to_vec() {
                let op: Box<dyn Operator> = match head {
                    "ea" => Box::new(Amplify::new(args.first().copied().unwrap_or(100.0))),
                    "chcopy" => {
                        if args.len() != 2 {
                            return Err(bad(token, "chcopy needs from,to").into());
                        }
                        Box::new(ChannelCopy::new(args[0] as u32, args[1] as u32))
                    }
                    _ => Box::new(DcFix::new(
                        args.first().copied().unwrap_or(0.0),
                        args.get(1).copied().unwrap_or(0.0),
                    )),
                };
                setup.add_operator_to(&chain, op)?;
            }
        }
        "kos" | "kl" => {
            let args: Vec<f64> = split_args(require_tail()?)
                .iter()
                .map(|a| parse_f64(token, a))
                .collect::<std::result::Result<_, _>>()?;
            let needed = if head == "kos" { 5 } else { 4 };
            if args.len() != needed {
                return Err(bad(token, format!("expected {needed} arguments")).into());
            }
            let param = args[0] as usize;
            if param == 0 {
                return Err(bad(token, "parameter numbers are 1-based").into());
            }
            let (low, high) = (args[1], args[2]);
            for chain in setup.selected_chain_names().to_vec() {
                let source: Box<dyn ControlSource> = if head == "kos" {
                    Box::new(SineOscillator::new(args[3], args[4]))
                } else {
                    Box::new(LinearEnvelope::new(args[3]))
                };
                setup.add_controller_to(&chain, param - 1, low, high, source)?;
            }
        }
        "Md" => {
            let label = unescape_commas(require_tail()?);
            setup.add_midi_device(&label)?;
        }
        _ => return Err(ParseError::UnknownOption(token.to_string()).into()),
    }
    Ok(())
}

/// Interpret a token sequence, pairing bare `-i` / `-o` with the
/// following token first.
pub fn interpret_options(setup: &mut Chainsetup, tokens: &[String]) -> Result<()> {
    let mut merged: Vec<String> = Vec::with_capacity(tokens.len());
    let mut iter = tokens.iter().peekable();
    while let Some(token) = iter.next() {
        if (token == "-i" || token == "-o")
            && iter.peek().map(|n| !n.starts_with('-')).unwrap_or(false)
        {
            let arg = iter.next().expect("peeked");
            merged.push(format!("{token}:{}", escape_commas(arg)));
        } else {
            merged.push(token.clone());
        }
    }
    for token in &merged {
        interpret_option(setup, token)?;
    }
    Ok(())
}

/// Parse a complete chainsetup from text.
///
/// Chains without an output after interpretation get the resources'
/// default output attached.
pub fn parse_chainsetup(text: &str, resources: Resources) -> Result<Chainsetup> {
    let tokens = tokenize(text)?;
    debug!(count = tokens.len(), "interpreting chainsetup tokens");
    let mut setup = Chainsetup::new("untitled", resources)?;
    interpret_options(&mut setup, &tokens)?;
    if !setup.chains().is_empty() {
        setup.attach_default_output()?;
    }
    Ok(setup)
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Emit the canonical text form of `setup`.
///
/// General options come first, then one line per chain carrying its
/// selection, input, operators, controllers and output.
pub fn serialize(setup: &Chainsetup) -> String {
    let mut out = String::new();

    let mut general: Vec<String> = Vec::new();
    general.push(format!("-n:{}", quote_token(&escape_commas(setup.name()))));
    if let Some(frames) = setup.overrides.buffersize {
        general.push(format!("-b:{frames}"));
    }
    if let Some(mode) = setup.buffering_mode() {
        general.push(format!("-B:{mode}"));
    }
    if setup.overrides.raised_priority == Some(true) {
        match setup.overrides.sched_priority {
            Some(prio) => general.push(format!("-r:{prio}")),
            None => general.push("-r".to_string()),
        }
    }
    general.push(format!("-f:{}", setup.default_format()));
    if let Some(secs) = setup.length_secs {
        general.push(format!("-t:{}", format_value(secs)));
    }
    if setup.is_looping() {
        general.push("-tl".to_string());
    }
    match setup.overrides.double_buffer {
        Some(true) => match setup.overrides.double_buffer_size {
            Some(size) => general.push(format!("-z:db,{size}")),
            None => general.push("-z:db".to_string()),
        },
        Some(false) => general.push("-z:nodb".to_string()),
        None => {}
    }
    match setup.multitrack_override {
        Some(true) => general.push("-z:multitrack".to_string()),
        Some(false) => general.push("-z:nomultitrack".to_string()),
        None => {}
    }
    if !setup.ignore_xruns() {
        general.push("-z:noignore_xruns".to_string());
    }
    let psr_default = setup
        .resources
        .boolean(crate::resources::DEFAULT_PRECISE_SAMPLE_RATES);
    if setup.precise_sample_rates != psr_default {
        general.push(if setup.precise_sample_rates {
            "-z:psr".to_string()
        } else {
            "-z:nopsr".to_string()
        });
    }
    let _ = writeln!(out, "{}", general.join(" "));

    let (inputs, outputs) = setup.endpoints();
    for chain in setup.chains() {
        let mut line: Vec<String> = Vec::new();
        line.push(format!("-a:{}", escape_commas(chain.name())));
        if let Some(i) = chain.input() {
            line.push(format!(
                "-i:{}",
                quote_token(&escape_commas(inputs[i].object().label()))
            ));
        }
        for k in 0..chain.operator_count() {
            let op = chain.operator(k).expect("operator index in range");
            let params: Vec<String> = (0..op.param_count())
                .map(|p| format_value(op.param(p)))
                .collect();
            if params.is_empty() {
                line.push(format!("-{}", op.name()));
            } else {
                line.push(format!("-{}:{}", op.name(), params.join(",")));
            }
            for ctrl in chain.controllers().iter().filter(|c| c.operator_index == k) {
                let mut args = vec![
                    format_value((ctrl.param_index + 1) as f64),
                    format_value(ctrl.low),
                    format_value(ctrl.high),
                ];
                args.extend(ctrl.source.args().iter().map(|&v| format_value(v)));
                line.push(format!("-{}:{}", ctrl.source.name(), args.join(",")));
            }
        }
        if let Some(o) = chain.output() {
            line.push(format!(
                "-o:{}",
                quote_token(&escape_commas(outputs[o].object().label()))
            ));
        }
        let _ = writeln!(out, "{}", line.join(" "));
    }

    for device in &setup.midi_devices {
        let _ = writeln!(out, "-Md:{}", escape_commas(device.lock().label()));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Chainsetup {
        parse_chainsetup(text, Resources::defaults()).unwrap()
    }

    #[test]
    fn tokenizer_splits_on_whitespace() {
        let tokens = tokenize("-a:1 -i:a.wav\n-o:out.wav").unwrap();
        assert_eq!(tokens, vec!["-a:1", "-i:a.wav", "-o:out.wav"]);
    }

    #[test]
    fn tokenizer_strips_comments() {
        let tokens = tokenize("-a:1 # select chain one\n-i:a.wav").unwrap();
        assert_eq!(tokens, vec!["-a:1", "-i:a.wav"]);
    }

    #[test]
    fn tokenizer_groups_quotes_and_escapes() {
        let tokens = tokenize(r#"-i:"my file.wav" -n:two\ words"#).unwrap();
        assert_eq!(tokens, vec!["-i:my file.wav", "-n:two words"]);
    }

    #[test]
    fn tokenizer_preserves_escaped_commas() {
        let tokens = tokenize(r"-i:odd\,name.wav").unwrap();
        assert_eq!(tokens, vec![r"-i:odd\,name.wav"]);
        assert_eq!(split_args(r"odd\,name.wav"), vec!["odd,name.wav"]);
    }

    #[test]
    fn tokenizer_rejects_unterminated_quote() {
        assert!(matches!(
            tokenize("-i:\"broken"),
            Err(ParseError::UnterminatedQuote(_))
        ));
    }

    #[test]
    fn split_args_handles_plain_lists() {
        assert_eq!(split_args("1,2,3"), vec!["1", "2", "3"]);
        assert_eq!(split_args(""), vec![""]);
    }

    #[test]
    fn general_options_apply() {
        let setup = parse("-n:mix -b:256 -B:rt -r:70 -f:s16_le,2,48000 -t:2.5 -tl");
        assert_eq!(setup.name(), "mix");
        assert_eq!(setup.buffersize(), 256);
        assert_eq!(setup.buffering_mode(), Some(BufferingMode::Rt));
        assert_eq!(setup.default_format().rate, 48000);
        assert!(setup.is_looping());
    }

    #[test]
    fn graph_options_build_the_graph() {
        let setup = parse(
            "-a:left -i:null -ea:50 -o:null \
             -a:right -i:rtnull -chcopy:1,2 -kos:1,1,2,0.5,0 -o:null",
        );
        assert_eq!(setup.chains().len(), 2);
        let left = &setup.chains()[0];
        assert_eq!(left.name(), "left");
        assert_eq!(left.operator_count(), 1);
        assert_eq!(left.operator(0).unwrap().param(0), 50.0);
        let right = &setup.chains()[1];
        assert_eq!(right.operator_count(), 1);
        assert_eq!(right.controller_count(), 1);
        assert_eq!(right.controllers()[0].param_index, 0);
    }

    #[test]
    fn bare_io_tokens_take_the_next_token() {
        let setup = parse("-a:1 -i null -o null");
        assert_eq!(setup.chains()[0].input(), Some(0));
        assert_eq!(setup.chains()[0].output(), Some(0));
    }

    #[test]
    fn missing_output_gets_the_default() {
        let setup = parse("-a:1 -i:null");
        assert_eq!(setup.chains()[0].output(), Some(0));
        assert_eq!(setup.endpoints().1[0].object().label(), "null");
    }

    #[test]
    fn unknown_options_are_rejected() {
        assert!(parse_chainsetup("-q:nope", Resources::defaults()).is_err());
        assert!(parse_chainsetup("novel", Resources::defaults()).is_err());
        assert!(parse_chainsetup("-z:frobnicate", Resources::defaults()).is_err());
    }

    #[test]
    fn controller_requires_an_operator() {
        assert!(parse_chainsetup("-a:1 -i:null -kos:1,0,1,1,0 -o:null", Resources::defaults())
            .is_err());
    }

    #[test]
    fn serialize_parse_fixpoint() {
        let setup = parse(
            "-n:fix -b:512 -f:s16_le,2,44100,i \
             -a:a -i:null -ea:75 -kl:1,0,100,2 -o:loop,1 \
             -a:b -i:loop,1 -dcfix:0.1,0 -o:null \
             -z:nodb -z:nomultitrack",
        );
        let first = serialize(&setup);
        let reparsed = parse_chainsetup(&first, Resources::defaults()).unwrap();
        let second = serialize(&reparsed);
        assert_eq!(first, second);
    }

    #[test]
    fn serialize_emits_escaped_labels() {
        let setup = parse(r"-a:1 -i:odd\,name.wav -o:null");
        let text = serialize(&setup);
        assert!(text.contains(r"-i:odd\,name.wav"), "{text}");
    }
}
