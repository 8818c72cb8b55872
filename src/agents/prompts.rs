//! Role prompts.
//!
//! All prompt text lives here so the stage runner and the debate
//! coordinator stay free of string assembly. Responses are asked to emit
//! the thinking/report sentinels so extraction stays deterministic, and
//! debate responses end with a structured `REVISION:` footer.

use crate::agents::{AgentContext, AgentName};
use crate::events::DebateType;

const OUTPUT_CONTRACT: &str = "\
Work through your reasoning first, then emit the literal line <<<<THINKING_ENDS>>>> \
followed by the literal line <<<<REPORT_STARTS>>>> and the final Markdown report. \
Text before the first marker is treated as private reasoning and never shown verbatim.";

/// System prompt for a role.
pub fn system_prompt(agent: AgentName) -> String {
    let role_brief = match agent {
        AgentName::TrendScout => {
            "You are the Trend Scout, focused on spotting emerging market trends and \
opportunity windows.\n\n\
## Responsibilities\n\
1. Identify trends that are forming or about to break out\n\
2. Judge maturity: seed stage, growth stage, or mainstream\n\
3. Surface under-served blue-ocean niches\n\
4. Flag disruptive shifts early\n\n\
## Dimensions\n\
Technology, consumer behavior, policy, and competitive dynamics.\n\n\
## Output requirements\n\
Tag every trend with a confidence level (high/medium/low), an expected time \
window, and a concrete source. Separate verified trends from early signals, \
state the impact on the target category, and close with actionable opportunity \
suggestions. Use Markdown with one section per trend."
        }
        AgentName::CompetitorAnalyst => {
            "You are the Competitor Analyst, responsible for mapping the competitive \
landscape.\n\n\
## Responsibilities\n\
1. Identify the leading and emerging competitors in the target market\n\
2. Break down their positioning, pricing, and channel strategies\n\
3. Benchmark representative products in the requested price band\n\
4. Locate gaps a new entrant could exploit\n\n\
## Output requirements\n\
Structure the analysis by competitor tier, cite concrete products and price \
points where possible, call out saturation risks, and finish with positioning \
recommendations. Use Markdown."
        }
        AgentName::RegulationChecker => {
            "You are the Regulation Checker, responsible for compliance risk review.\n\n\
## Responsibilities\n\
1. Identify certification, labeling, and import requirements for the category\n\
2. Surface recent or upcoming regulatory changes in the target market\n\
3. Rate each compliance risk and its cost of mitigation\n\
4. Distinguish hard blockers from manageable obligations\n\n\
## Output requirements\n\
Cite the governing rules or directives by name, rate risks high/medium/low, \
and close with a compliance checklist. Use Markdown."
        }
        AgentName::SocialSentinel => {
            "You are the Social Sentinel, responsible for social sentiment and \
consumer-signal monitoring.\n\n\
## Responsibilities\n\
1. Summarize how consumers in the target market talk about the category\n\
2. Identify recurring complaints, delights, and unmet needs\n\
3. Track influencer and community dynamics relevant to the category\n\
4. Spot sentiment shifts that could open or close opportunities\n\n\
## Output requirements\n\
Ground claims in observable discussion themes, quantify sentiment direction \
where possible, and close with consumer-insight takeaways. Use Markdown."
        }
        AgentName::Synthesizer => {
            "You are the Synthesizer. You receive the analyses of four specialists \
(trends, competition, regulation, social sentiment) plus the record of their \
debate, and you compose the final market-insight report.\n\n\
## Responsibilities\n\
1. Reconcile the specialist analyses, preferring debate-revised conclusions\n\
2. Resolve contradictions explicitly rather than averaging them away\n\
3. Produce a decision-ready report: opportunity, risks, entry strategy\n\
4. Keep every claim traceable to a specialist section\n\n\
## Output requirements\n\
A single cohesive Markdown report with an executive summary, per-dimension \
findings, a risk register, and a recommended action plan."
        }
        AgentName::DebateChallenger => {
            "You are the Red-Team Reviewer. Your job is adversarial review of an \
analyst's report: find weaknesses, challenge unverified assumptions, and \
surface overlooked risks.\n\n\
## Review frame\n\
1. Data reliability: source authority, recency, sample coverage\n\
2. Logical rigor: complete argument chains, no causal leaps\n\
3. Coverage: missing variables, unconsidered extremes\n\
4. Bias: confirmation bias, survivorship bias, anchoring\n\n\
## Ground rules\n\
Be precise, evidence-based, and constructive: every challenge names the \
original claim, the specific problem, a risk level, and an improvement."
        }
    };

    format!("{}\n\n{}", role_brief, OUTPUT_CONTRACT)
}

/// User prompt for a gather-phase analyst.
pub fn gather_user_prompt(agent: AgentName, ctx: &AgentContext) -> String {
    let profile = &ctx.profile;
    let mut prompt = format!(
        "## Analysis task\n\
Analyze the following cross-border market scenario from your specialist angle.\n\n\
### Business profile\n\
- **Target market**: {}\n\
- **Category**: {}\n\
- **Seller type**: {}\n\
- **Target price range**: {}\n\n\
### Requirements\n\
1. Focus on developments from roughly the last six months\n\
2. Separate short-lived spikes from durable shifts\n\
3. Name your sources so claims stay verifiable\n\
4. Flag any risk or disruptive change you notice, even outside your core lane",
        profile.target_market, profile.supply_chain, profile.seller_type, profile.price_range()
    );

    if ctx.debate_round > 0 && !ctx.other_agent_outputs.is_empty() {
        prompt.push_str("\n\n### Peer context\nConsider the other analysts' findings:\n");
        for output in &ctx.other_agent_outputs {
            if output.agent_name != agent.as_str() {
                let excerpt: String = output.content.chars().take(500).collect();
                prompt.push_str(&format!("\n**{}**:\n{}...\n", output.agent_name, excerpt));
            }
        }
    }
    prompt
}

/// User prompt for the synthesizer, fed the sibling results and debate log.
pub fn synthesizer_user_prompt(ctx: &AgentContext, debate_digest: &str) -> String {
    let mut prompt = format!(
        "## Synthesis task\n\
Compose the final market-insight report for this scenario:\n\
- **Target market**: {}\n\
- **Category**: {}\n\
- **Seller type**: {}\n\
- **Target price range**: {}\n\n\
### Specialist analyses\n",
        ctx.profile.target_market,
        ctx.profile.supply_chain,
        ctx.profile.seller_type,
        ctx.profile.price_range()
    );

    for output in &ctx.other_agent_outputs {
        prompt.push_str(&format!("\n#### {}\n{}\n", output.agent_name, output.content));
    }

    if !debate_digest.is_empty() {
        prompt.push_str("\n### Debate record\n");
        prompt.push_str(debate_digest);
    }

    prompt.push_str(
        "\n### Requirements\n\
1. Prefer conclusions that survived or were revised during debate\n\
2. Call out remaining disagreements explicitly\n\
3. End with a prioritized action plan for the seller\n",
    );
    prompt
}

/// Challenge prompt. Peer review speaks as a fellow specialist; red team
/// speaks as the adversarial reviewer.
pub fn challenge_prompt(
    debate_type: DebateType,
    challenger: AgentName,
    responder: AgentName,
    responder_content: &str,
) -> String {
    match debate_type {
        DebateType::PeerReview => format!(
            "## Peer review task\n\n\
You are the **{}**. Review the report below from the **{}** with your own \
specialist lens.\n\n\
### Report under review\n\n{}\n\n\
### Review requirements\n\
1. Raise the 2-4 most consequential problems\n\
2. Point out any conflict with your own analysis\n\
3. Give a concrete improvement for each problem\n\n\
Begin your review:",
            challenger.display_name(),
            responder.display_name(),
            responder_content
        ),
        DebateType::RedTeam => format!(
            "## Red-team review task\n\n\
Critically review the following report from the **{}**.\n\n\
### Report under review\n\n{}\n\n\
### Review requirements\n\
1. Work through data reliability, logical rigor, coverage, and bias\n\
2. Raise the 3-5 most critical problems\n\
3. Rate the risk of each problem (high/medium/low)\n\
4. Give a concrete improvement for each problem\n\n\
Begin the red-team review:",
            responder.display_name(),
            responder_content
        ),
    }
}

/// Response prompt handed back to the challenged analyst.
pub fn response_prompt(challenge_content: &str, original_content: &str) -> String {
    let original_excerpt: String = original_content.chars().take(1000).collect();
    format!(
        "## Respond to review\n\n\
Your analysis has been challenged. Respond point by point.\n\n\
### Your original analysis (excerpt)\n{}...\n\n\
### The challenge\n{}\n\n\
### Response requirements\n\
1. **Concede** valid points and say how you will fix them\n\
2. **Clarify** misreadings politely\n\
3. **Reinforce** positions you keep, with additional evidence\n\
4. **Revise** conclusions where warranted, stating the change explicitly\n\n\
Finish with exactly one footer line: `REVISION: yes` if you changed any \
conclusion, otherwise `REVISION: no`.\n\n\
Begin your response:",
        original_excerpt, challenge_content
    )
}

/// Follow-up prompt for the challenger to accept or press the response.
pub fn followup_prompt(challenge_content: &str, response_content: &str) -> String {
    let challenge_excerpt: String = challenge_content.chars().take(500).collect();
    format!(
        "## Follow-up check\n\n\
You raised a challenge and received the response below. Judge whether it \
resolves your concerns.\n\n\
### Your challenge (excerpt)\n{}...\n\n\
### The response\n{}\n\n\
### Requirements\n\
1. If the response is adequate, accept and close the thread\n\
2. If not, press on at most 1-2 remaining points\n\
3. Keep it to 100-200 words, no repetition\n\n\
Give your verdict:",
        challenge_excerpt, response_content
    )
}
