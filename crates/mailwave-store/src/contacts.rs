//! Contact lists and contacts.

use rusqlite::params;

use mailwave_shared::{ContactListId, ContactStatus};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Contact, ContactList};
use crate::rows;

impl Database {
    pub fn create_contact_list(&self, list: &ContactList) -> Result<()> {
        self.conn().execute(
            "INSERT INTO contact_lists (id, user_id, name, total_contacts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                list.id.to_string(),
                list.user_id.to_string(),
                list.name,
                list.total_contacts,
                list.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_contact_list(&self, id: ContactListId) -> Result<ContactList> {
        self.conn()
            .query_row(
                "SELECT id, user_id, name, total_contacts, created_at
                 FROM contact_lists WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(ContactList {
                        id: rows::parsed(row, 0)?,
                        user_id: rows::parsed(row, 1)?,
                        name: row.get(2)?,
                        total_contacts: row.get(3)?,
                        created_at: rows::timestamp(row, 4)?,
                    })
                },
            )
            .map_err(StoreError::from_query)
    }

    /// Import contacts into a list and bump its denormalized count, all in
    /// one transaction.
    pub fn insert_contacts(&mut self, list_id: ContactListId, contacts: &[Contact]) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO contacts (id, list_id, email, first_name, last_name, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for contact in contacts {
                stmt.execute(params![
                    contact.id.to_string(),
                    list_id.to_string(),
                    contact.email,
                    contact.first_name,
                    contact.last_name,
                    contact.status.as_str(),
                    contact.created_at.to_rfc3339(),
                ])?;
            }
        }
        tx.execute(
            "UPDATE contact_lists SET total_contacts = total_contacts + ?1 WHERE id = ?2",
            params![contacts.len() as i64, list_id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Contacts of a list with status `active`, in import order.
    pub fn get_active_contacts(&self, list_id: ContactListId) -> Result<Vec<Contact>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, list_id, email, first_name, last_name, status, created_at
             FROM contacts
             WHERE list_id = ?1 AND status = ?2
             ORDER BY rowid ASC",
        )?;

        let rows = stmt.query_map(
            params![list_id.to_string(), ContactStatus::Active.as_str()],
            row_to_contact,
        )?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Mark every contact with `email` (case-insensitive) as `status`.
    /// Returns the number of contacts changed.
    pub fn set_contact_status_by_email(&self, email: &str, status: ContactStatus) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE contacts SET status = ?1
             WHERE email = ?2 COLLATE NOCASE AND status != ?1",
            params![status.as_str(), email.trim()],
        )?;
        Ok(affected)
    }
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: rows::parsed(row, 0)?,
        list_id: rows::parsed(row, 1)?,
        email: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        status: rows::parsed(row, 5)?,
        created_at: rows::timestamp(row, 6)?,
    })
}
