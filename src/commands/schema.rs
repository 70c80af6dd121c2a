//! `agentchat schema`: print the pgvector provisioning SQL.

use clap::ArgMatches;

pub fn run(matches: &ArgMatches) {
    let dimension = matches.get_one::<u32>("dimension").copied().unwrap_or(1536);
    println!("{}", "=".repeat(60));
    println!("Vector store setup SQL");
    println!("{}", "=".repeat(60));
    println!("\nRun this in your Postgres (pgvector) SQL editor:\n");
    println!("{}", setup_sql(dimension));
    println!("{}", match_function_sql(dimension));
    println!("{}", "=".repeat(60));
}

/// Extension, `documents` table, and cosine ivfflat index.
pub fn setup_sql(dimension: u32) -> String {
    format!(
        r#"-- Enable the pgvector extension
create extension if not exists vector;

-- Create the documents table
create table if not exists documents (
  id bigserial primary key,
  content text,
  metadata jsonb,
  embedding vector({dimension})
);

-- Create index for faster similarity search
create index if not exists documents_embedding_idx on documents
using ivfflat (embedding vector_cosine_ops)
with (lists = 100);
"#
    )
}

/// `match_documents(query_embedding, match_count, filter)` ordered by
/// cosine distance, returning `1 - distance` as similarity.
pub fn match_function_sql(dimension: u32) -> String {
    format!(
        r#"-- Create or replace the matching function
create or replace function match_documents (
  query_embedding vector({dimension}),
  match_count int default null,
  filter jsonb default '{{}}'
) returns table (
  id bigint,
  content text,
  metadata jsonb,
  similarity float
)
language plpgsql
as $$
begin
  return query
  select
    documents.id,
    documents.content,
    documents.metadata,
    1 - (documents.embedding <=> query_embedding) as similarity
  from documents
  where documents.metadata @> filter
  order by documents.embedding <=> query_embedding
  limit match_count;
end;
$$;
"#
    )
}
