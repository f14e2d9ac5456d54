// Prompt assembly for the completion calls the pipeline makes.
// Every prompt shares one layout: job record, resume, candidate context, instruction.

use serde_json::Value;

/// Structuring prompt. Replace `{posting}` before sending.
pub const JOB_STRUCTURE_PROMPT_TEMPLATE: &str = r#"Extract the job posting below into a single JSON object with these keys:
"title", "company", "location", "seniority", "responsibilities" (list), "requirements" (list), "nice_to_have" (list).
Use null for anything the posting does not state. Respond with the JSON object only.

### Posting:
{posting}"#;

const ATS_REPORT_FORMAT: &str = "\
    Respond with a single JSON object and nothing else:\n\
    {\"score\": integer 0-100, \"summary\": string, \"recommendations\": array of strings}\n\
    Base the score and summary on: years of experience against the requirements, \
    roles and responsibilities against the job, and qualifications (degrees, certifications, skills).";

/// ATS analysis instruction appended after the shared layout.
pub const ATS_ANALYSIS_INSTRUCTION: &str = "\
    Act as an applicant tracking system. Analyze the existing resume against the job \
    description. Give at most 3 recommendations that would raise the score for this job. \
    Do not rewrite the resume.";

/// Instruction for scoring the rewritten resume.
pub const ATS_RESCORE_INSTRUCTION: &str = "\
    Act as an applicant tracking system. The resume above has been rewritten for this job; \
    analyze it against the job description. Give at most 2 recommendations for final tweaks.";

/// Generation instruction appended after the shared layout.
pub const RESUME_GENERATION_INSTRUCTION: &str = "\
    Rewrite the existing resume so it is optimized for the job description above. \
    Keep every fact traceable to the existing resume or the additional candidate data. \
    Do not invent employers, titles, dates or credentials.";

const MARKDOWN_ONLY_TRAILER: &str = "Only output the resume in markdown atx format as the final output.\n\
    Don't include any additional information or symbols.";

pub fn build_structure_prompt(posting_text: &str) -> String {
    JOB_STRUCTURE_PROMPT_TEMPLATE.replace("{posting}", posting_text)
}

pub fn build_analysis_prompt(job: &Value, resume_text: &str) -> String {
    assemble(job, resume_text, &[], ATS_ANALYSIS_INSTRUCTION, Some(ATS_REPORT_FORMAT))
}

pub fn build_rescore_prompt(job: &Value, markdown: &str) -> String {
    assemble(job, markdown, &[], ATS_RESCORE_INSTRUCTION, Some(ATS_REPORT_FORMAT))
}

/// `analysis` is the caller-reviewed ATS report from the first segment.
pub fn build_generation_prompt(
    job: &Value,
    resume_text: &str,
    analysis: &str,
    additional_context: &[String],
) -> String {
    let instruction = format!("### ATS Analysis:\n{analysis}\n\n{RESUME_GENERATION_INSTRUCTION}");
    assemble(
        job,
        resume_text,
        additional_context,
        &instruction,
        Some(MARKDOWN_ONLY_TRAILER),
    )
}

fn assemble(
    job: &Value,
    resume_text: &str,
    additional_context: &[String],
    instruction: &str,
    trailer: Option<&str>,
) -> String {
    let job_block = serde_json::to_string_pretty(job).unwrap_or_else(|_| job.to_string());
    let mut prompt = format!(
        "### Job Description:\n{job_block}\n\n### Existing Resume:\n{}\n\n### Additional Candidate Data:\n{}\n\n{instruction}",
        resume_text.trim(),
        additional_context.join("\n\n"),
    );
    if let Some(trailer) = trailer {
        prompt.push_str("\n\n");
        prompt.push_str(trailer);
    }
    prompt
}
