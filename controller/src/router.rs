//! URL pattern matching. Patterns are a sequence of literal path segments
//! and named captures (`<name>`), matched literally segment-by-segment,
//! first-registered-handler-wins on ties.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Capture(String),
}

pub struct Route<H> {
    pattern: String,
    segments: Vec<Segment>,
    pub handler: H,
}

pub struct Router<H> {
    routes: Vec<Route<H>>,
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

#[derive(Debug)]
pub struct PatternError(pub String);

impl std::fmt::Display for PatternError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PatternError {}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, PatternError> {
    let mut segments = Vec::new();
    for part in pattern.split('/').filter(|s| !s.is_empty()) {
        let opens = part.matches('<').count();
        let closes = part.matches('>').count();
        if opens != closes || opens > 1 {
            return Err(PatternError(format!(
                "unbalanced capture delimiters in segment {part:?} of pattern {pattern:?}"
            )));
        }
        if opens == 1 {
            if !part.starts_with('<') || !part.ends_with('>') {
                return Err(PatternError(format!(
                    "capture must span the whole segment: {part:?}"
                )));
            }
            let name = &part[1..part.len() - 1];
            if name.is_empty() {
                return Err(PatternError(format!("empty capture name in {pattern:?}")));
            }
            segments.push(Segment::Capture(name.to_string()));
        } else {
            segments.push(Segment::Literal(part.to_string()));
        }
    }
    Ok(segments)
}

impl<H> Router<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under a URL pattern. Order of registration is
    /// the tie-breaker when multiple patterns could match the same path.
    pub fn register(&mut self, pattern: &str, handler: H) -> Result<(), PatternError> {
        let segments = parse_pattern(pattern)?;
        self.routes.push(Route {
            pattern: pattern.to_string(),
            segments,
            handler,
        });
        Ok(())
    }

    /// Returns the first registered route matching `path`, plus the
    /// captured `<name>` -> segment-value pairs.
    pub fn matches(&self, path: &str) -> Option<(&H, Vec<(String, String)>)> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        'routes: for route in &self.routes {
            if route.segments.len() != parts.len() {
                continue;
            }
            let mut captures = Vec::new();
            for (seg, part) in route.segments.iter().zip(parts.iter()) {
                match seg {
                    Segment::Literal(lit) => {
                        if lit != part {
                            continue 'routes;
                        }
                    }
                    Segment::Capture(name) => captures.push((name.clone(), part.to_string())),
                }
            }
            return Some((&route.handler, captures));
        }
        None
    }

    #[cfg(test)]
    fn pattern_of(&self, idx: usize) -> &str {
        &self.routes[idx].pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pattern_matches_exactly() {
        let mut r: Router<&str> = Router::new();
        r.register("/stats", "stats").unwrap();
        let (h, caps) = r.matches("/stats").unwrap();
        assert_eq!(*h, "stats");
        assert!(caps.is_empty());
        assert!(r.matches("/stats/extra").is_none());
    }

    #[test]
    fn single_segment_capture_matches_one_segment_only() {
        let mut r: Router<&str> = Router::new();
        r.register("/<x>", "capture").unwrap();
        let (_, caps) = r.matches("/foo").unwrap();
        assert_eq!(caps, vec![("x".to_string(), "foo".to_string())]);
        assert!(r.matches("/foo/bar").is_none());
    }

    #[test]
    fn first_registered_handler_wins_on_overlap() {
        let mut r: Router<&str> = Router::new();
        r.register("/<x>", "capture").unwrap();
        r.register("/stats", "literal").unwrap();
        let (h, _) = r.matches("/stats").unwrap();
        assert_eq!(*h, "capture");
        assert_eq!(r.pattern_of(0), "/<x>");
    }

    #[test]
    fn unbalanced_capture_is_a_configuration_error() {
        let mut r: Router<&str> = Router::new();
        assert!(r.register("/<x", "bad").is_err());
        assert!(r.register("/x>", "bad").is_err());
    }
}
