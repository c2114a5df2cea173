/// Calendar duration split into parts, as stored in interval/duration columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsoDuration {
    pub years: i64,
    pub months: i64,
    pub weeks: i64,
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
}

impl IsoDuration {
    pub fn hours(hours: i64) -> Self {
        Self {
            hours,
            ..Self::default()
        }
    }

    pub fn days(days: i64) -> Self {
        Self {
            days,
            ..Self::default()
        }
    }

    fn parts(&self) -> [i64; 7] {
        [
            self.years,
            self.months,
            self.weeks,
            self.days,
            self.hours,
            self.minutes,
            self.seconds,
        ]
    }

    fn negated(&self) -> Self {
        Self {
            years: -self.years,
            months: -self.months,
            weeks: -self.weeks,
            days: -self.days,
            hours: -self.hours,
            minutes: -self.minutes,
            seconds: -self.seconds,
        }
    }

    /// ISO-8601 text, e.g. `PT1H`, `P1Y2M3DT4H`, `-P2D`, `PT0S`.
    ///
    /// Weeks stay as `W` only when no other date part is present; otherwise
    /// they fold into days. A duration whose parts are all non-positive is
    /// rendered with a leading minus.
    pub fn iso8601(&self) -> String {
        let parts = self.parts();
        if parts.iter().all(|part| *part == 0) {
            return "PT0S".to_string();
        }
        let negative = parts.iter().all(|part| *part <= 0);
        let value = if negative { self.negated() } else { *self };

        let mut weeks = value.weeks;
        let mut days = value.days;
        if weeks != 0 && (value.years != 0 || value.months != 0 || days != 0) {
            days += weeks * 7;
            weeks = 0;
        }

        let mut out = String::from("P");
        for (amount, unit) in [(value.years, 'Y'), (value.months, 'M'), (weeks, 'W'), (days, 'D')] {
            if amount != 0 {
                out.push_str(&format!("{amount}{unit}"));
            }
        }
        let mut time = String::new();
        for (amount, unit) in [(value.hours, 'H'), (value.minutes, 'M'), (value.seconds, 'S')] {
            if amount != 0 {
                time.push_str(&format!("{amount}{unit}"));
            }
        }
        if !time.is_empty() {
            out.push('T');
            out.push_str(&time);
        }
        if negative {
            format!("-{out}")
        } else {
            out
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (negative, rest) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let rest = rest.strip_prefix('P')?;
        let (date_part, time_part) = match rest.split_once('T') {
            Some((date, time)) => (date, Some(time)),
            None => (rest, None),
        };

        let mut parsed = Self::default();
        let mut digits = String::new();
        for ch in date_part.chars() {
            if ch.is_ascii_digit() || ch == '-' {
                digits.push(ch);
                continue;
            }
            let amount = digits.parse::<i64>().ok()?;
            digits.clear();
            match ch {
                'Y' => parsed.years = amount,
                'M' => parsed.months = amount,
                'W' => parsed.weeks = amount,
                'D' => parsed.days = amount,
                _ => return None,
            }
        }
        if !digits.is_empty() {
            return None;
        }
        if let Some(time_part) = time_part {
            if time_part.is_empty() {
                return None;
            }
            for ch in time_part.chars() {
                if ch.is_ascii_digit() || ch == '-' {
                    digits.push(ch);
                    continue;
                }
                let amount = digits.parse::<i64>().ok()?;
                digits.clear();
                match ch {
                    'H' => parsed.hours = amount,
                    'M' => parsed.minutes = amount,
                    'S' => parsed.seconds = amount,
                    _ => return None,
                }
            }
            if !digits.is_empty() {
                return None;
            }
        }

        Some(if negative { parsed.negated() } else { parsed })
    }
}
