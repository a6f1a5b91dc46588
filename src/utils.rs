use std::sync::Once;
use time::macros::format_description;
use tracing_subscriber::{fmt::time::LocalTime, EnvFilter};

static INIT: Once = Once::new();

/// `RUST_LOG` wins when set; otherwise `--verbose` selects `info`, else `error`.
pub fn setup_logging(verbose: bool) {
    INIT.call_once(|| {
        let default_level = if verbose { "info" } else { "error" };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));
        let timer = LocalTime::new(format_description!(
            "[hour]:[minute]:[second].[subsecond digits:3]"
        ));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(timer)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    });
}

pub fn format_number(num: usize) -> String {
    let digits = num.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

pub fn format_percent(value: f64) -> String {
    format!("{:.1}%", value * 100.0)
}

pub fn validate_args(args: &crate::args::Args) -> anyhow::Result<()> {
    if args.min_occurrences == 0 {
        anyhow::bail!("--min-occurrences must be greater than 0");
    }

    if let Some(top) = args.top {
        if top == 0 {
            anyhow::bail!("--top must be greater than 0");
        }
    }

    if let Some(workers) = args.workers {
        if workers == 0 {
            anyhow::bail!("--workers must be greater than 0");
        }
    }

    if args.snapshot.is_none() && !args.init_signatures {
        anyhow::bail!("--snapshot is required unless --init-signatures is given");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_thousands() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn percent_has_one_decimal() {
        assert_eq!(format_percent(0.6), "60.0%");
        assert_eq!(format_percent(0.0126), "1.3%");
    }
}
