//! Command line options of the tracing tool.
//!
//! The host forwards the tool's argument vector verbatim, so the options
//! parse with ordinary `clap` derive. Defaults mirror a plain
//! "trace the executable into ./out*" invocation.

use clap::Parser;

/// Default value of `-r`, doubling as the "no substitution" sentinel: the
/// argument cannot be distinguished from an absent one, so this magic value
/// keeps RDRAND untouched.
pub const RDRAND_DISABLED_SENTINEL: u64 = 0x0BAD_BADB_ADBA_DBAD;

/// Tracer configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "leaktrace", about = "DBI execution tracer for side-channel analysis")]
pub struct TracerOptions {
    /// File name/path prefix for trace output.
    #[arg(short = 'o', long = "output-prefix", default_value = "out")]
    pub output_prefix: String,

    /// List of interesting images, separated by `:` or `;`
    /// (case-insensitive substring match).
    #[arg(short = 'i', long = "interesting-images", default_value = ".exe")]
    pub interesting_images: String,

    /// Emulated CPU model: 0 = default (off), 1 = Pentium3, 2 = Merom,
    /// 3 = Westmere, 4 = Ivybridge. The host CPU should form a superset of
    /// the selected model.
    #[arg(short = 'c', long = "cpu", default_value_t = 0)]
    pub cpu_model: u32,

    /// Constant output for the RDRAND instruction.
    #[arg(short = 'r', long = "fixed-random", default_value_t = RDRAND_DISABLED_SENTINEL)]
    pub fixed_random: u64,

    /// Enable stack allocation tracking (0 or 1).
    #[arg(short = 's', long = "stack-tracking", default_value_t = 0)]
    pub stack_allocation_tracking: i32,
}

impl TracerOptions {
    /// The output prefix with surrounding whitespace removed.
    #[must_use]
    pub fn trimmed_output_prefix(&self) -> String {
        self.output_prefix.trim().to_string()
    }

    /// The interesting-image substrings, lowercased, empty items dropped.
    #[must_use]
    pub fn interesting_patterns(&self) -> Vec<String> {
        self.interesting_images
            .split([':', ';'])
            .filter(|item| !item.is_empty())
            .map(str::to_lowercase)
            .collect()
    }

    /// The fixed RDRAND value, or `None` when substitution is disabled.
    #[must_use]
    pub fn fixed_random_value(&self) -> Option<u64> {
        (self.fixed_random != RDRAND_DISABLED_SENTINEL).then_some(self.fixed_random)
    }

    /// Whether stack allocation tracking was requested.
    #[must_use]
    pub fn stack_tracking_enabled(&self) -> bool {
        self.stack_allocation_tracking != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let options = TracerOptions::parse_from(["leaktrace"]);
        assert_eq!(options.output_prefix, "out");
        assert_eq!(options.interesting_patterns(), vec![".exe".to_string()]);
        assert_eq!(options.cpu_model, 0);
        assert_eq!(options.fixed_random_value(), None);
        assert!(!options.stack_tracking_enabled());
    }

    #[test]
    fn image_list_splits_on_both_separators() {
        let options =
            TracerOptions::parse_from(["leaktrace", "-i", "Target.EXE:libcrypto;;wolfssl"]);
        assert_eq!(
            options.interesting_patterns(),
            vec![
                "target.exe".to_string(),
                "libcrypto".to_string(),
                "wolfssl".to_string()
            ]
        );
    }

    #[test]
    fn rdrand_sentinel_disables_substitution() {
        let options = TracerOptions::parse_from(["leaktrace", "-r", "841534158063459245"]);
        assert_eq!(options.fixed_random, RDRAND_DISABLED_SENTINEL);
        assert_eq!(options.fixed_random_value(), None);

        let options = TracerOptions::parse_from(["leaktrace", "-r", "12345"]);
        assert_eq!(options.fixed_random_value(), Some(12345));
    }

    #[test]
    fn stack_tracking_flag_parses_as_integer() {
        let options = TracerOptions::parse_from(["leaktrace", "-s", "1"]);
        assert!(options.stack_tracking_enabled());
    }

    #[test]
    fn output_prefix_is_trimmed() {
        let options = TracerOptions::parse_from(["leaktrace", "-o", " /tmp/run_ "]);
        assert_eq!(options.trimmed_output_prefix(), "/tmp/run_");
    }
}
