use hive_protocol::{TaskNode, TaskPhase, TaskSnapshot, TaskStats};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

static CHECKBOX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\s*)[-*] \[(.)\] (.*)$").unwrap());
static PHASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:\*\*)?Phase\s+\d+:\s*(.+?)\s*(?:\*\*)?$").unwrap());
static TRAILING_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*<!--(?:[^-]|-[^-]|--[^>])*-->\s*$").unwrap());
static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(@([^)]*)\)|\[([^\]]*)\]|\{([^}]*)\}").unwrap());

const TAB_WIDTH: usize = 4;

/// Nodes and phases of one checklist document, in document order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedTasks {
    pub phases: Vec<TaskPhase>,
    pub tasks: Vec<TaskNode>,
}

/// Parse a checklist document. Lines that are neither a checkbox item nor a
/// phase heading are ignored.
pub fn parse_document(text: &str) -> ParsedTasks {
    let mut parsed = ParsedTasks::default();
    let mut phase: Option<String> = None;

    for line in text.lines() {
        let Some(caps) = CHECKBOX.captures(line) else {
            continue;
        };
        let indent = &caps[1];
        let marker = &caps[2];
        let body = caps[3].trim();

        if let Some(heading) = PHASE.captures(body) {
            let name = heading[1].to_string();
            parsed.phases.push(TaskPhase {
                name: name.clone(),
                total: 0,
                completed: 0,
            });
            phase = Some(name);
            continue;
        }

        let node = parse_item(indent, marker, body, phase.clone());
        if let Some(current) = parsed.phases.last_mut() {
            current.total += 1;
            if node.completed {
                current.completed += 1;
            }
        }
        parsed.tasks.push(node);
    }
    parsed
}

/// Full snapshot for `text`; counters are recomputed from every node.
pub fn snapshot(source: Option<PathBuf>, text: &str) -> TaskSnapshot {
    let ParsedTasks { phases, tasks } = parse_document(text);
    let stats = TaskStats::from_nodes(&tasks);
    TaskSnapshot {
        source,
        phases,
        tasks,
        stats,
    }
}

fn parse_item(indent: &str, marker: &str, body: &str, phase: Option<String>) -> TaskNode {
    let width: usize = indent
        .chars()
        .map(|c| if c == '\t' { TAB_WIDTH } else { 1 })
        .sum();

    let mut text = TRAILING_COMMENT.replace(body, "").into_owned();
    let mut agent = None;
    let mut complexity = None;
    let mut model = None;
    // First annotation of each kind wins; later ones stay in the text.
    let mut consumed = Vec::new();
    for caps in TAG.captures_iter(&text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let slot = if let Some(m) = caps.get(1) {
            Some((&mut agent, m))
        } else if let Some(m) = caps.get(2) {
            // `[label](url)` is a markdown link, not a complexity tag.
            if text[whole.end()..].starts_with('(') {
                None
            } else {
                Some((&mut complexity, m))
            }
        } else {
            caps.get(3).map(|m| (&mut model, m))
        };
        if let Some((slot, m)) = slot {
            if slot.is_none() {
                *slot = Some(m.as_str().trim().to_string());
                consumed.push(whole.range());
            }
        }
    }
    for range in consumed.into_iter().rev() {
        text.replace_range(range, " ");
    }
    let stripped = text;
    let content = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    TaskNode {
        id: task_id(&content),
        completed: marker == "x",
        in_progress: marker == "/",
        depth: width / TAB_WIDTH,
        phase,
        agent,
        complexity,
        model,
        content,
    }
}

/// Content-derived id: first 16 hex chars of SHA-256 of the cleaned text.
///
/// Two items with identical text share an id, and editing an item's text
/// changes its id.
pub fn task_id(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(16);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "- [ ] **Phase 1: Setup**\n- [x] Install deps (@Gemini) [Low] {flash}\n    - [/] Configure env\n";

    #[test]
    fn sample_document() {
        let snap = snapshot(None, SAMPLE);
        assert_eq!(snap.tasks.len(), 2);

        let install = &snap.tasks[0];
        assert_eq!(install.content, "Install deps");
        assert!(install.completed);
        assert!(!install.in_progress);
        assert_eq!(install.agent.as_deref(), Some("Gemini"));
        assert_eq!(install.complexity.as_deref(), Some("Low"));
        assert_eq!(install.model.as_deref(), Some("flash"));
        assert_eq!(install.depth, 0);
        assert_eq!(install.phase.as_deref(), Some("Setup"));

        let configure = &snap.tasks[1];
        assert_eq!(configure.content, "Configure env");
        assert!(configure.in_progress);
        assert!(!configure.completed);
        assert_eq!(configure.depth, 1);
        assert_eq!(configure.phase.as_deref(), Some("Setup"));

        assert_eq!(
            snap.stats,
            TaskStats {
                total: 2,
                completed: 1,
                in_progress: 1,
                pending: 0
            }
        );
        assert_eq!(
            snap.phases,
            vec![TaskPhase {
                name: "Setup".to_string(),
                total: 2,
                completed: 1
            }]
        );
    }

    #[test]
    fn reparse_is_byte_identical() {
        let first = serde_json::to_string(&snapshot(None, SAMPLE)).unwrap();
        let second = serde_json::to_string(&snapshot(None, SAMPLE)).unwrap();
        assert_eq!(first, second);
        assert_eq!(snapshot(None, SAMPLE).tasks[0].id, task_id("Install deps"));
        assert_eq!(task_id("Install deps").len(), 16);
    }

    #[test]
    fn trailing_html_comment_is_stripped() {
        let parsed = parse_document("- [ ] Write docs {pro} <!-- id: 42 -->\n");
        assert_eq!(parsed.tasks[0].content, "Write docs");
        assert_eq!(parsed.tasks[0].model.as_deref(), Some("pro"));
    }

    #[test]
    fn tags_anywhere_in_the_text_are_consumed() {
        let parsed = parse_document("* [ ] [High] Ship (@Claude)   the   release\n");
        let node = &parsed.tasks[0];
        assert_eq!(node.content, "Ship the release");
        assert_eq!(node.complexity.as_deref(), Some("High"));
        assert_eq!(node.agent.as_deref(), Some("Claude"));
        assert!(node.is_pending());
    }

    #[test]
    fn only_first_tag_of_each_kind_is_consumed() {
        let parsed = parse_document("- [ ] Fix [bug] in the [High] parser {pro} {flash}\n");
        let node = &parsed.tasks[0];
        assert_eq!(node.complexity.as_deref(), Some("bug"));
        assert_eq!(node.model.as_deref(), Some("pro"));
        assert_eq!(node.content, "Fix in the [High] parser {flash}");
    }

    #[test]
    fn markdown_links_keep_their_label() {
        let parsed = parse_document("- [ ] Read [docs](https://example.com/x) [Low]\n");
        let node = &parsed.tasks[0];
        assert_eq!(node.content, "Read [docs](https://example.com/x)");
        assert_eq!(node.complexity.as_deref(), Some("Low"));
    }

    #[test]
    fn only_the_last_html_comment_is_stripped() {
        let parsed = parse_document("- [ ] a <!-- x --> b <!-- y -->\n");
        assert_eq!(parsed.tasks[0].content, "a <!-- x --> b");
    }

    #[test]
    fn nodes_before_first_phase_have_no_phase() {
        let doc = "- [ ] Prep\n- [ ] Phase 2: Build\n- [x] Compile\n";
        let parsed = parse_document(doc);
        assert_eq!(parsed.tasks.len(), 2);
        assert_eq!(parsed.tasks[0].phase, None);
        assert_eq!(parsed.tasks[1].phase.as_deref(), Some("Build"));
        assert_eq!(parsed.phases[0].total, 1);
    }

    #[test]
    fn unrelated_lines_are_skipped() {
        let doc = "# Tasks\n\nSome prose.\n-[ ] no space\n- [ ]\n1. [ ] numbered\n- [ ] Real item\n";
        let parsed = parse_document(doc);
        assert_eq!(parsed.tasks.len(), 1);
        assert_eq!(parsed.tasks[0].content, "Real item");
    }

    #[test]
    fn tabs_and_markers() {
        let doc = "\t- [X] Upper x is not done\n\t\t- [?] Odd marker\n      - [x] Six spaces\n";
        let parsed = parse_document(doc);
        assert_eq!(parsed.tasks[0].depth, 1);
        assert!(!parsed.tasks[0].completed);
        assert!(parsed.tasks[0].is_pending());
        assert_eq!(parsed.tasks[1].depth, 2);
        assert!(parsed.tasks[1].is_pending());
        assert_eq!(parsed.tasks[2].depth, 1);
        assert!(parsed.tasks[2].completed);
    }
}
