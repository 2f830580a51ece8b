//! Loop and chain detection over open pull requests.
//!
//! Multiple AI agents acknowledging each other's PRs can spiral into a
//! follow-up-PR chain that never converges. The detector builds a graph
//! over the open PRs, bounds engagement by chain depth, recognizes
//! repeated feedback with a Jaccard heuristic, and backs everything with
//! a per-PR acknowledgment rate limit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::LazyLock;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ports::PullRequestData;

/// PRs deeper than this in a chain are disengaged.
pub const MAX_CHAIN_DEPTH: usize = 3;

/// Acknowledgments allowed per PR inside the rate window.
const ACK_LIMIT: usize = 3;

/// The acknowledgment rate window.
const ACK_WINDOW: Duration = Duration::from_secs(2 * 60 * 60);

/// Adjacent-PR phrase overlap above this counts as repetition.
const REPETITION_OVERLAP: f64 = 0.5;

/// Consecutive overlapping pairs required to call it a loop.
const REPETITION_PAIRS: usize = 2;

/// Characters of each comment kept for the repetition heuristic.
const PHRASE_PREFIX_CHARS: usize = 120;

static BRANCH_PARENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:sub-pr-|pr[-/])(\d+)").expect("valid regex"));

static ISSUE_REF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#(\d+)").expect("valid regex"));

static CODE_BLOCK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```|`[^`]*`").expect("valid regex"));

/// One PR in the chain graph; parents and children are node indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainNode {
    pub pr_number: u64,
    pub parents: Vec<usize>,
    pub children: Vec<usize>,
    pub depth: usize,
}

/// The open-PR chain graph.
#[derive(Debug, Clone)]
pub struct ChainGraph {
    nodes: Vec<ChainNode>,
    by_number: HashMap<u64, usize>,
}

impl ChainGraph {
    /// Build the graph from the currently open PRs. Edges come from
    /// three signals: base-equals-head branch nesting, parent-naming
    /// branch patterns, and in-body references to older open PRs.
    pub fn build(prs: &[PullRequestData]) -> Self {
        let mut nodes: Vec<ChainNode> = prs
            .iter()
            .map(|pr| ChainNode {
                pr_number: pr.number,
                parents: Vec::new(),
                children: Vec::new(),
                depth: 0,
            })
            .collect();
        let by_number: HashMap<u64, usize> =
            prs.iter().enumerate().map(|(i, pr)| (pr.number, i)).collect();
        let by_head: HashMap<&str, usize> = prs
            .iter()
            .enumerate()
            .map(|(i, pr)| (pr.head_branch.as_str(), i))
            .collect();

        let mut edges: HashSet<(usize, usize)> = HashSet::new();
        for (child_idx, pr) in prs.iter().enumerate() {
            // Signal 1: our base branch is another PR's head branch.
            if let Some(&parent_idx) = by_head.get(pr.base_branch.as_str()) {
                if parent_idx != child_idx {
                    edges.insert((parent_idx, child_idx));
                }
            }
            // Signal 2: branch name names a parent PR.
            if let Some(caps) = BRANCH_PARENT_REGEX.captures(&pr.head_branch) {
                if let Ok(parent_number) = caps[1].parse::<u64>() {
                    if let Some(&parent_idx) = by_number.get(&parent_number) {
                        if parent_idx != child_idx {
                            edges.insert((parent_idx, child_idx));
                        }
                    }
                }
            }
            // Signal 3: body references an older open PR.
            for caps in ISSUE_REF_REGEX.captures_iter(&pr.body) {
                if let Ok(referenced) = caps[1].parse::<u64>() {
                    if referenced < pr.number {
                        if let Some(&parent_idx) = by_number.get(&referenced) {
                            if parent_idx != child_idx {
                                edges.insert((parent_idx, child_idx));
                            }
                        }
                    }
                }
            }
        }

        for (parent, child) in edges {
            nodes[parent].children.push(child);
            nodes[child].parents.push(parent);
        }
        for node in &mut nodes {
            node.parents.sort_unstable();
            node.children.sort_unstable();
        }

        let mut graph = Self { nodes, by_number };
        graph.compute_depths();
        graph
    }

    /// BFS from the roots. Nodes unreachable from any root sit inside a
    /// cycle and get `MAX_CHAIN_DEPTH + 1`, the disengage marker.
    fn compute_depths(&mut self) {
        let mut visited = vec![false; self.nodes.len()];
        let mut queue: VecDeque<usize> = VecDeque::new();

        for (i, node) in self.nodes.iter().enumerate() {
            if node.parents.is_empty() {
                visited[i] = true;
                queue.push_back(i);
            }
        }
        while let Some(i) = queue.pop_front() {
            let depth = self.nodes[i].depth;
            let children = self.nodes[i].children.clone();
            for child in children {
                if !visited[child] {
                    visited[child] = true;
                    self.nodes[child].depth = depth + 1;
                    queue.push_back(child);
                }
            }
        }
        for (i, seen) in visited.iter().enumerate() {
            if !seen {
                self.nodes[i].depth = MAX_CHAIN_DEPTH + 1;
            }
        }
    }

    pub fn node(&self, pr_number: u64) -> Option<&ChainNode> {
        self.by_number.get(&pr_number).map(|&i| &self.nodes[i])
    }

    pub fn depth_of(&self, pr_number: u64) -> Option<usize> {
        self.node(pr_number).map(|n| n.depth)
    }

    /// Root-to-PR path, following the first parent at each step. Cycles
    /// are cut off once a node repeats.
    pub fn chain_trace(&self, pr_number: u64) -> Vec<u64> {
        let Some(&start) = self.by_number.get(&pr_number) else {
            return Vec::new();
        };
        let mut trace = vec![self.nodes[start].pr_number];
        let mut seen = HashSet::from([start]);
        let mut current = start;
        while let Some(&parent) = self.nodes[current].parents.first() {
            if !seen.insert(parent) {
                break;
            }
            trace.push(self.nodes[parent].pr_number);
            current = parent;
        }
        trace.reverse();
        trace
    }

    /// Number of PRs on the trace from root to this PR.
    pub fn chain_len(&self, pr_number: u64) -> usize {
        self.chain_trace(pr_number).len()
    }
}

/// Per-PR acknowledgment rate limiter: at most three acks per two hours.
pub struct AckLimiter {
    window: Duration,
    max: usize,
    events: Mutex<HashMap<u64, Vec<Instant>>>,
}

impl AckLimiter {
    pub fn new() -> Self {
        Self::with_window(ACK_WINDOW, ACK_LIMIT)
    }

    pub fn with_window(window: Duration, max: usize) -> Self {
        Self {
            window,
            max,
            events: Mutex::new(HashMap::new()),
        }
    }

    /// Record an acknowledgment if the window allows one. Returns false
    /// when the budget is exhausted.
    pub fn try_acquire(&self, pr_number: u64) -> bool {
        let Ok(mut events) = self.events.lock() else {
            return false;
        };
        let now = Instant::now();
        let entry = events.entry(pr_number).or_default();
        entry.retain(|at| now.duration_since(*at) < self.window);
        if entry.len() >= self.max {
            return false;
        }
        entry.push(now);
        true
    }
}

impl Default for AckLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// True for drafts and work-in-progress titles the agent must not touch.
pub fn is_wip(pr: &PullRequestData) -> bool {
    if pr.draft {
        return true;
    }
    let title = pr.title.trim();
    let lowered = title.to_lowercase();
    lowered.starts_with("[wip]")
        || lowered.starts_with("wip:")
        || lowered.starts_with("draft:")
        || lowered.starts_with("[draft]")
        || title.contains('🚧')
}

/// Strip code, lowercase, and keep the first ~120 chars of a comment.
pub fn comment_phrase(comment: &str) -> String {
    let stripped = CODE_BLOCK_REGEX.replace_all(comment, " ");
    let lowered = stripped.to_lowercase();
    let collapsed: String = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(PHRASE_PREFIX_CHARS).collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Detect repeated feedback along a chain: each element is one PR's
/// phrase set, ordered root to leaf. Two consecutive adjacent pairs above
/// the overlap threshold means the conversation is going in circles.
pub fn feedback_repetition(chain_phrases: &[HashSet<String>]) -> bool {
    if chain_phrases.len() < 3 {
        return false;
    }
    let mut consecutive = 0usize;
    for pair in chain_phrases.windows(2) {
        if jaccard(&pair[0], &pair[1]) > REPETITION_OVERLAP {
            consecutive += 1;
            if consecutive >= REPETITION_PAIRS {
                return true;
            }
        } else {
            consecutive = 0;
        }
    }
    false
}

/// Verdict on whether to engage with a PR's review activity.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainDecision {
    Engage,
    /// Depth 3: still engaged, but the next link disengages.
    EngageWithWarning,
    /// First disengagement for this chain; post the trace once.
    Disengage { trace: Vec<u64> },
    /// Chain already disengaged this session; stay silent.
    AlreadyDisengaged,
    RateLimited,
    SkipWip,
}

/// Session-scoped chain policy: depth bound, repetition heuristic, rate
/// limiting, and the per-chain disengage-once rule.
pub struct ChainDetector {
    limiter: AckLimiter,
    disengaged_roots: Mutex<HashSet<u64>>,
}

impl ChainDetector {
    pub fn new() -> Self {
        Self {
            limiter: AckLimiter::new(),
            disengaged_roots: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_limiter(limiter: AckLimiter) -> Self {
        Self {
            limiter,
            disengaged_roots: Mutex::new(HashSet::new()),
        }
    }

    /// Decide whether to acknowledge activity on `pr`. `chain_phrases`
    /// carries the phrase sets for the PR's chain, root to leaf.
    pub fn assess(
        &self,
        graph: &ChainGraph,
        pr: &PullRequestData,
        chain_phrases: &[HashSet<String>],
    ) -> ChainDecision {
        if is_wip(pr) {
            return ChainDecision::SkipWip;
        }

        let trace = graph.chain_trace(pr.number);
        let root = trace.first().copied().unwrap_or(pr.number);
        if self.is_disengaged(root) {
            return ChainDecision::AlreadyDisengaged;
        }

        let depth = graph.depth_of(pr.number).unwrap_or(0);
        if depth > MAX_CHAIN_DEPTH {
            self.mark_disengaged(root);
            return ChainDecision::Disengage { trace };
        }

        if trace.len() >= 3 && depth >= 2 && feedback_repetition(chain_phrases) {
            self.mark_disengaged(root);
            return ChainDecision::Disengage { trace };
        }

        if !self.limiter.try_acquire(pr.number) {
            return ChainDecision::RateLimited;
        }

        if depth == MAX_CHAIN_DEPTH {
            ChainDecision::EngageWithWarning
        } else {
            ChainDecision::Engage
        }
    }

    fn is_disengaged(&self, root: u64) -> bool {
        self.disengaged_roots
            .lock()
            .map(|set| set.contains(&root))
            .unwrap_or(false)
    }

    fn mark_disengaged(&self, root: u64) {
        if let Ok(mut set) = self.disengaged_roots.lock() {
            set.insert(root);
        }
    }
}

impl Default for ChainDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pr(number: u64, head: &str, base: &str, body: &str) -> PullRequestData {
        PullRequestData {
            number,
            title: format!("PR {}", number),
            body: body.to_string(),
            url: format!("https://example.com/pull/{}", number),
            author: "argus-bot".to_string(),
            head_branch: head.to_string(),
            base_branch: base.to_string(),
            draft: false,
            created_at: Utc::now(),
        }
    }

    fn phrases(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_base_head_edges_and_depths() {
        // 12 <- 13 <- 14 <- 15, linked by base == parent's head.
        let prs = vec![
            pr(12, "argus/issue-42", "main", ""),
            pr(13, "fix-a", "argus/issue-42", ""),
            pr(14, "fix-b", "fix-a", ""),
            pr(15, "fix-c", "fix-b", ""),
        ];
        let graph = ChainGraph::build(&prs);
        assert_eq!(graph.depth_of(12), Some(0));
        assert_eq!(graph.depth_of(13), Some(1));
        assert_eq!(graph.depth_of(14), Some(2));
        assert_eq!(graph.depth_of(15), Some(3));
        assert_eq!(graph.chain_trace(15), vec![12, 13, 14, 15]);
    }

    #[test]
    fn test_branch_name_pattern_edge() {
        let prs = vec![
            pr(7, "feature", "main", ""),
            pr(9, "sub-pr-7-touchup", "main", ""),
            pr(11, "pr/7-nits", "main", ""),
        ];
        let graph = ChainGraph::build(&prs);
        assert_eq!(graph.depth_of(9), Some(1));
        assert_eq!(graph.depth_of(11), Some(1));
    }

    #[test]
    fn test_body_reference_edge_only_older_prs() {
        let prs = vec![
            pr(5, "a", "main", "references #9 which is newer"),
            pr(9, "b", "main", "follow-up to #5"),
        ];
        let graph = ChainGraph::build(&prs);
        // 9 -> 5 edge only; the newer-PR reference in #5 is ignored.
        assert_eq!(graph.depth_of(5), Some(0));
        assert_eq!(graph.depth_of(9), Some(1));
    }

    #[test]
    fn test_cycle_gets_overflow_depth() {
        // Two PRs based on each other's heads: no root reaches them.
        let prs = vec![pr(1, "alpha", "beta", ""), pr(2, "beta", "alpha", "")];
        let graph = ChainGraph::build(&prs);
        assert_eq!(graph.depth_of(1), Some(MAX_CHAIN_DEPTH + 1));
        assert_eq!(graph.depth_of(2), Some(MAX_CHAIN_DEPTH + 1));
    }

    #[test]
    fn test_is_wip_variants() {
        let mut base = pr(1, "a", "main", "");
        assert!(!is_wip(&base));
        base.draft = true;
        assert!(is_wip(&base));

        for title in ["[WIP] thing", "WIP: thing", "Draft: thing", "[Draft] thing", "🚧 thing"] {
            let mut candidate = pr(1, "a", "main", "");
            candidate.title = title.to_string();
            assert!(is_wip(&candidate), "{} should be WIP", title);
        }
    }

    #[test]
    fn test_comment_phrase_strips_code_and_case() {
        let phrase = comment_phrase("Please FIX the `unwrap()` here:\n```rust\nlet x = 1;\n```\nthanks");
        assert!(phrase.contains("please fix the"));
        assert!(!phrase.contains("unwrap"));
        assert!(!phrase.contains("let x"));
        assert!(phrase.len() <= PHRASE_PREFIX_CHARS);
    }

    #[test]
    fn test_feedback_repetition_detects_loops() {
        let same = phrases(&["please add tests for the parser", "missing error handling"]);
        assert!(feedback_repetition(&[same.clone(), same.clone(), same.clone()]));
    }

    #[test]
    fn test_feedback_repetition_needs_three_prs() {
        let same = phrases(&["please add tests"]);
        assert!(!feedback_repetition(&[same.clone(), same.clone()]));
    }

    #[test]
    fn test_feedback_repetition_ignores_diverse_chains() {
        let a = phrases(&["please add tests"]);
        let b = phrases(&["rename this function"]);
        let c = phrases(&["update the docs"]);
        assert!(!feedback_repetition(&[a, b, c]));
    }

    #[test]
    fn test_ack_limiter_allows_three_then_blocks() {
        let limiter = AckLimiter::new();
        assert!(limiter.try_acquire(12));
        assert!(limiter.try_acquire(12));
        assert!(limiter.try_acquire(12));
        assert!(!limiter.try_acquire(12));
        // Other PRs have their own budget.
        assert!(limiter.try_acquire(13));
    }

    #[test]
    fn test_ack_limiter_window_expiry() {
        let limiter = AckLimiter::with_window(Duration::from_millis(10), 1);
        assert!(limiter.try_acquire(12));
        assert!(!limiter.try_acquire(12));
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.try_acquire(12));
    }

    #[test]
    fn test_detector_depth_scenario() {
        // Scenario: #12 root, each later PR targets the previous head.
        let prs = vec![
            pr(12, "argus/issue-42", "main", ""),
            pr(13, "fix-a", "argus/issue-42", ""),
            pr(14, "fix-b", "fix-a", ""),
            pr(15, "fix-c", "fix-b", ""),
            pr(16, "fix-d", "fix-c", ""),
        ];
        let graph = ChainGraph::build(&prs);
        let detector = ChainDetector::new();

        // Depth 3 engages with a warning.
        assert_eq!(
            detector.assess(&graph, &prs[3], &[]),
            ChainDecision::EngageWithWarning
        );

        // Depth 4 disengages exactly once, with the full trace.
        match detector.assess(&graph, &prs[4], &[]) {
            ChainDecision::Disengage { trace } => {
                assert_eq!(trace, vec![12, 13, 14, 15, 16]);
            }
            other => panic!("Expected Disengage, got {:?}", other),
        }

        // The whole chain stays silent afterwards.
        assert_eq!(
            detector.assess(&graph, &prs[4], &[]),
            ChainDecision::AlreadyDisengaged
        );
        assert_eq!(
            detector.assess(&graph, &prs[3], &[]),
            ChainDecision::AlreadyDisengaged
        );
    }

    #[test]
    fn test_detector_repetition_disengages() {
        let prs = vec![
            pr(12, "argus/issue-42", "main", ""),
            pr(13, "fix-a", "argus/issue-42", ""),
            pr(14, "fix-b", "fix-a", ""),
        ];
        let graph = ChainGraph::build(&prs);
        let detector = ChainDetector::new();
        let same = phrases(&["please add tests for the parser"]);
        let chain = vec![same.clone(), same.clone(), same.clone()];

        match detector.assess(&graph, &prs[2], &chain) {
            ChainDecision::Disengage { trace } => assert_eq!(trace, vec![12, 13, 14]),
            other => panic!("Expected Disengage, got {:?}", other),
        }
    }

    #[test]
    fn test_detector_rate_limit() {
        let prs = vec![pr(12, "argus/issue-42", "main", "")];
        let graph = ChainGraph::build(&prs);
        let detector = ChainDetector::with_limiter(AckLimiter::with_window(
            Duration::from_secs(3600),
            1,
        ));
        assert_eq!(detector.assess(&graph, &prs[0], &[]), ChainDecision::Engage);
        assert_eq!(
            detector.assess(&graph, &prs[0], &[]),
            ChainDecision::RateLimited
        );
    }

    #[test]
    fn test_detector_skips_wip() {
        let mut wip = pr(12, "a", "main", "");
        wip.draft = true;
        let graph = ChainGraph::build(&[wip.clone()]);
        let detector = ChainDetector::new();
        assert_eq!(detector.assess(&graph, &wip, &[]), ChainDecision::SkipWip);
    }
}
