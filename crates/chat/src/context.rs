use psup_storage::ProblemStatement;

/// Renders the problem block that is prepended to the first outgoing turn.
///
/// Only the request copy of the conversation carries this block; stored and
/// displayed messages keep the text the user actually typed.
pub fn problem_context(problem: &ProblemStatement, code: Option<&str>) -> String {
    let mut sections = vec![
        format!(
            "[Problem]\nTitle: {} (#{})\nTime limit: {}\nMemory limit: {}",
            problem.title,
            problem.id,
            or_unknown(&problem.time_limit),
            or_unknown(&problem.memory_limit),
        ),
        format!("[Description]\n{}", problem.description.trim()),
        format!("[Input]\n{}", problem.input_description.trim()),
        format!("[Output]\n{}", problem.output_description.trim()),
    ];

    if !problem.samples.is_empty() {
        let samples = problem
            .samples
            .iter()
            .enumerate()
            .map(|(index, sample)| {
                format!(
                    "Sample {}:\nInput:\n{}\nOutput:\n{}",
                    index + 1,
                    sample.input.trim_end(),
                    sample.output.trim_end()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        sections.push(format!("[Samples]\n{samples}"));
    }

    if let Some(code) = code
        && !code.trim().is_empty()
    {
        sections.push(format!("[User Code]\n{code}"));
    }

    sections.join("\n\n")
}

/// Prefixes `content` with the problem block, separated by a blank line.
pub fn with_problem_context(problem: &ProblemStatement, code: Option<&str>, content: &str) -> String {
    format!("{}\n\n{content}", problem_context(problem, code))
}

fn or_unknown(value: &str) -> &str {
    if value.trim().is_empty() { "unknown" } else { value }
}

#[cfg(test)]
mod tests {
    use psup_storage::Sample;

    use super::*;

    fn two_sum() -> ProblemStatement {
        ProblemStatement {
            id: "1000".to_string(),
            title: "A+B".to_string(),
            description: "Add two numbers.".to_string(),
            input_description: "Two integers A and B.".to_string(),
            output_description: "Print A+B.".to_string(),
            samples: vec![
                Sample {
                    input: "1 2\n".to_string(),
                    output: "3\n".to_string(),
                },
                Sample {
                    input: "5 5".to_string(),
                    output: "10".to_string(),
                },
            ],
            time_limit: "2 s".to_string(),
            memory_limit: String::new(),
        }
    }

    #[test]
    fn block_lists_statement_sections_and_numbered_samples() {
        let block = problem_context(&two_sum(), None);

        assert!(block.starts_with("[Problem]\nTitle: A+B (#1000)\nTime limit: 2 s"));
        assert!(block.contains("Memory limit: unknown"));
        assert!(block.contains("[Input]\nTwo integers A and B."));
        assert!(block.contains("Sample 1:\nInput:\n1 2\nOutput:\n3"));
        assert!(block.contains("Sample 2:\nInput:\n5 5\nOutput:\n10"));
        assert!(!block.contains("[User Code]"));
    }

    #[test]
    fn code_attachment_is_appended_last() {
        let block = problem_context(&two_sum(), Some("print(sum(map(int, input().split())))"));

        assert!(block.ends_with("[User Code]\nprint(sum(map(int, input().split())))"));
    }

    #[test]
    fn prefixed_content_keeps_a_blank_line_separator() {
        let prefixed = with_problem_context(&two_sum(), None, "hint please");

        assert!(prefixed.ends_with("Print A+B.\n\n[Samples]\nSample 1:\nInput:\n1 2\nOutput:\n3\n\nSample 2:\nInput:\n5 5\nOutput:\n10\n\nhint please"));
    }
}
