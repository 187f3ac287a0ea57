use serde::{Deserialize, Serialize};

use super::extract::NOT_RELEVANT;

/// How the prompt describes the data to the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStrategy {
    /// Embed the live introspected schema text.
    #[default]
    SchemaDriven,
    /// Embed a built-in description of the placement dataset and allow the
    /// model to answer with the not-relevant sentinel.
    FixedSchema,
}

/// Built-in description of the placement dataset, including the
/// categorical domains the model should filter on.
pub const PLACEMENT_SCHEMA: &str = "\
CREATE TABLE students (
    student_id SERIAL PRIMARY KEY,
    name VARCHAR(100) NOT NULL,
    email VARCHAR(150) UNIQUE,
    department VARCHAR(20),        -- one of 'CSE', 'ECE', 'EEE', 'MECH', 'CIVIL'
    cgpa NUMERIC(4, 2),            -- 0.00 to 10.00
    graduation_year INTEGER,
    placement_status VARCHAR(20)   -- one of 'placed', 'unplaced', 'opted_out'
);

CREATE TABLE companies (
    company_id SERIAL PRIMARY KEY,
    name VARCHAR(100) NOT NULL,
    industry VARCHAR(30),          -- one of 'ML', 'Web', 'Fintech', 'Core', 'Consulting', 'Product'
    visit_month INTEGER,           -- 1 (January) to 12 (December)
    location VARCHAR(100)
);

CREATE TABLE offers (
    offer_id SERIAL PRIMARY KEY,
    student_id INTEGER REFERENCES students(student_id),
    company_id INTEGER REFERENCES companies(company_id),
    role VARCHAR(100),
    ctc_lpa NUMERIC(6, 2),         -- annual compensation in lakhs per annum
    offer_type VARCHAR(20),        -- one of 'full_time', 'internship', 'ppo'
    offer_date DATE
);

CREATE TABLE skills (
    skill_id SERIAL PRIMARY KEY,
    name VARCHAR(50) NOT NULL,
    category VARCHAR(30)           -- one of 'programming', 'ml', 'web', 'database', 'cloud', 'soft_skill'
);

CREATE TABLE studentskills (
    student_id INTEGER REFERENCES students(student_id),
    skill_id INTEGER REFERENCES skills(skill_id),
    proficiency VARCHAR(20),       -- one of 'beginner', 'intermediate', 'advanced'
    PRIMARY KEY (student_id, skill_id)
);
";

pub fn build_prompt(strategy: PromptStrategy, question: &str, schema_text: &str) -> String {
    match strategy {
        PromptStrategy::SchemaDriven => format!(
            "\nGiven the following PostgreSQL database schema:\n{schema}\n\
             Convert this natural language question to a valid SQL query:\n\
             Question: {question}\n\n\
             Return only the SQL query without any explanation or additional text.\n",
            schema = schema_text,
            question = question.trim(),
        ),
        PromptStrategy::FixedSchema => format!(
            "\nYou write PostgreSQL queries for a campus placement database with these tables:\n\n\
             {schema}\n\
             Convert this natural language question to a single valid SQL query:\n\
             Question: {question}\n\n\
             Return only the SQL query without any explanation or additional text.\n\
             If the question cannot be answered from these tables, return exactly: {sentinel}\n",
            schema = PLACEMENT_SCHEMA,
            question = question.trim(),
            sentinel = NOT_RELEVANT,
        ),
    }
}
