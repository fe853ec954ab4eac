//! G-code scanning helpers

/// Temperatures at or below this are not print temperatures (standby, off)
const MIN_PRINT_TEMPERATURE: f64 = 150.0;

/// Find the nozzle temperature a G-code program heats to.
///
/// Returns the last `M104`/`M109` `S` value above 150°C, ignoring comments.
pub fn target_temperature(gcode: &str) -> Option<f64> {
    let mut target = None;
    for line in gcode.lines() {
        let code = line.split(';').next().unwrap_or("").trim();
        let mut words = code.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        if !command.eq_ignore_ascii_case("M104") && !command.eq_ignore_ascii_case("M109") {
            continue;
        }
        for word in words {
            if let Some(value) = word.strip_prefix('S').or_else(|| word.strip_prefix('s')) {
                if let Ok(t) = value.parse::<f64>() {
                    if t > MIN_PRINT_TEMPERATURE {
                        target = Some(t);
                    }
                }
            }
        }
    }
    target
}

/// Executable lines of a G-code program: comments stripped, blanks dropped
pub fn program_lines(gcode: &str) -> Vec<String> {
    gcode
        .lines()
        .map(|line| line.split(';').next().unwrap_or("").trim())
        .filter(|code| !code.is_empty())
        .map(str::to_string)
        .collect()
}
