//! Topic name and topic filter handling. Filters may contain `+` (exactly
//! one level) and `#` (zero or more levels, last segment only).

/// True when the filter contains any wildcard and has to go through the
/// wildcard side of a subscription index
pub fn has_wildcards(filter: &str) -> bool {
    filter.contains('+') || filter.contains('#')
}

/// Concrete topic names carry no wildcards
pub fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !has_wildcards(topic)
}

/// Validates the shape of a subscription filter. Wildcards have to occupy a
/// whole level and `#` is only allowed as the last level
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }

    let segments: Vec<&str> = filter.split('/').collect();
    let last = segments.len() - 1;
    for (position, segment) in segments.iter().enumerate() {
        if segment.contains('#') && (*segment != "#" || position != last) {
            return false;
        }

        if segment.contains('+') && *segment != "+" {
            return false;
        }
    }

    true
}

/// Checks if a concrete topic name is matched by a filter.
///
/// `#` matches the remaining levels including zero of them, `+` matches
/// exactly one. Topics starting with `$` are reserved for the broker and are
/// never matched by a filter whose first level is a wildcard
pub fn matches(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let topic_segments: Vec<&str> = topic.split('/').collect();
    let filter_segments: Vec<&str> = filter.split('/').collect();

    let mut position = 0;
    for segment in filter_segments.iter() {
        match *segment {
            "#" => return true,
            "+" => {
                if position >= topic_segments.len() {
                    return false;
                }

                position += 1;
            }
            literal => {
                if position >= topic_segments.len() || topic_segments[position] != literal {
                    return false;
                }

                position += 1;
            }
        }
    }

    position == topic_segments.len()
}
